pub mod expiry;
pub mod poll_ender;
