pub mod defer;
pub mod qsbr;

pub use defer::{DeferQueue, Reclaimed};
pub use qsbr::{Qsbr, QsbrStatus, QSBR_CNT_INIT, QSBR_CNT_THR_OFFLINE};
