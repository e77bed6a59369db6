/// Opaque unsigned identifier used for sources, targets and cookies.
pub type Id = u64;

/// Sentinel for every identifier field.
pub const UNKNOWN_ID: Id = 0;

/// Reserved cookie values.
///
/// Cookies minted by the router always have a non-zero generation in the
/// upper 32 bits, so they never collide with the values below.
pub mod cookie {
    use super::Id;

    /// No cookie assigned.
    pub const UNKNOWN: Id = super::UNKNOWN_ID;

    /// Endpoint lives in the same process; nothing is routed.
    pub const LOCAL: Id = 1;

    /// Messages originated by the router itself.
    pub const ROUTER: Id = 2;

    /// Fan-out target for notification-class messages.
    pub const BROADCAST: Id = u64::MAX;

    /// Smallest cookie the router can mint.
    pub const FIRST_MINTED: Id = 1 << 32;

    /// Returns true if `id` is one of the reserved values above.
    pub fn is_reserved(id: Id) -> bool {
        matches!(id, UNKNOWN | LOCAL | ROUTER | BROADCAST)
    }
}
