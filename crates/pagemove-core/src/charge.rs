//! Resource-accounting hook around a migration

use crate::page::FrameId;

/// Token returned by [`ChargeHook::prepare`] and handed back to
/// [`ChargeHook::end`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeToken {
    /// Source frame
    pub src: FrameId,
    /// Destination frame
    pub dst: FrameId,
    /// Hook-defined value
    pub cookie: u64,
}

/// Accounting collaborator notified around every single-page migration
pub trait ChargeHook: Send + Sync {
    /// Begin charging a `(src, dst)` pair
    fn prepare(&self, src: FrameId, dst: FrameId) -> ChargeToken;

    /// Finish charging, recording whether the migration committed
    fn end(&self, token: ChargeToken, committed: bool);
}

/// Hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCharge;

impl ChargeHook for NoCharge {
    fn prepare(&self, src: FrameId, dst: FrameId) -> ChargeToken {
        ChargeToken { src, dst, cookie: 0 }
    }

    fn end(&self, _token: ChargeToken, _committed: bool) {}
}
