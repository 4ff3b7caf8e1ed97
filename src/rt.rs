// src/rt.rs

use crate::logging::{DiagKind, DiagSender, DiagSource};
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};

/// Priority tiers for the engine's threads. The audio device callback thread
/// is owned by the audio subsystem and promoted by it; these cover the
/// producer side.
#[derive(Debug, Clone, Copy)]
pub enum Tier {
    /// Spectral and wavetable engine threads.
    Engine,
    /// Additive worker threads.
    Worker,
}

impl Tier {
    fn value(self) -> u8 {
        match self {
            Tier::Engine => 75,
            Tier::Worker => 70,
        }
    }
}

/// Best-effort promotion of the current thread. Elevated privileges are never
/// required to start: when the OS refuses, the thread keeps running at the
/// default priority and the refusal is reported once by the caller's source.
pub fn promote_current_thread(tier: Tier, source: DiagSource, diag: &DiagSender) {
    let priority = match ThreadPriorityValue::try_from(tier.value()) {
        Ok(v) => ThreadPriority::Crossplatform(v),
        Err(_) => ThreadPriority::Max,
    };
    if set_current_thread_priority(priority).is_err() {
        diag.report(source, DiagKind::PriorityDenied);
    }
}
