pub mod analysis;
pub mod health;
pub mod history;
pub mod session;

pub use self::analysis::analyze;
pub use self::health::health;
pub use self::history::history;
pub use self::session::SessionConfig;
