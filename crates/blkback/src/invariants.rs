//! Debug assertion macros for pool and ring invariants.
//!
//! Active only in debug builds, so there is zero overhead in release builds.

/// Assert the free list never outgrows the pool.
///
/// **Invariant**: `0 ≤ n_free ≤ ring_size`
macro_rules! debug_assert_free_bounded {
    ($free:expr, $size:expr) => {
        debug_assert!(
            $free <= $size,
            "free list holds {} entries for {} slots",
            $free,
            $size
        )
    };
}

/// Assert a slot is not released twice.
///
/// **Invariant**: no slot index appears twice on the free list
macro_rules! debug_assert_not_free {
    ($list:expr, $idx:expr) => {
        debug_assert!(
            !$list.contains(&$idx),
            "slot {} is already on the free list",
            $idx
        )
    };
}

/// Assert a retiring slot has given its bounce buffer back.
///
/// **Invariant**: a slot owns a bounce buffer only between translation
/// success and completion end
macro_rules! debug_assert_slot_idle {
    ($slot:expr, $idx:expr) => {
        debug_assert!(
            $slot.bounce.is_none(),
            "slot {} released while still owning a bounce buffer",
            $idx
        )
    };
}

/// Assert the backend never runs its private response producer more than one
/// ring ahead of what the guest has seen.
///
/// **Invariant**: `rsp_prod_pvt - rsp_prod ≤ ring_size`
macro_rules! debug_assert_responses_fit {
    ($pvt:expr, $shared:expr, $size:expr) => {
        debug_assert!(
            $pvt.wrapping_sub($shared) <= $size,
            "unpublished responses overrun the ring"
        )
    };
}

pub(crate) use debug_assert_free_bounded;
pub(crate) use debug_assert_not_free;
pub(crate) use debug_assert_responses_fit;
pub(crate) use debug_assert_slot_idle;
