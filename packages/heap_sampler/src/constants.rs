// Only used for locks that are never held while foreign code runs, so poisoning means the
// crate itself panicked mid-update and the protected state can no longer be trusted.
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - a panic escaped while \
    heap profiler state was being updated";

pub(crate) const ERR_TLS_SLOT_NOT_INITIALIZED: &str =
    "heap_sampler::init_tls_slot() must be called before any allocation event is recorded";
