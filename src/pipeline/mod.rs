pub mod controller;
pub mod progress;
pub mod reconcile;

pub use controller::RunController;
pub use progress::{spawn_ticker, ProgressBoard, TICK};
pub use reconcile::OWNER_ROLE;
