pub mod clock;
pub mod logging;

pub use clock::SessionClock;
pub use logging::init_logging;
