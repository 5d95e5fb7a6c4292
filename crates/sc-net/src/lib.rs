//! Network front ends for both transports: [`stream`] for the
//! TCP echo/reverse/time demo, [`secure`] for the authenticated DTLS-over-UDP
//! game protocol. Both run exclusively on the main thread; neither is
//! `Send`-shared with the worker pool.

pub mod secure;
pub mod stream;
