pub mod ticketlock;

pub use ticketlock::{RawTicketLock, RecursiveTicketLock, TicketLock, TicketLockGuard, Tickets};
