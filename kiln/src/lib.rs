#[cfg(feature = "kiln-base")]
pub use kiln_base as base;

#[cfg(feature = "kiln-scheduler")]
pub use kiln_scheduler as scheduler;

#[cfg(feature = "kiln-worker")]
pub use kiln_worker as worker;
