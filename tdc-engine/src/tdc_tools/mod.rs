pub mod circular_buffer;
pub mod coincidence;
pub mod delay;
pub mod freeze;
pub mod hg2;
pub mod startstop;
