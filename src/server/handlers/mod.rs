pub mod drivers;
pub mod rides;
pub mod ws;
