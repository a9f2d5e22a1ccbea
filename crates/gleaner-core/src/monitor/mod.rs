//! Monitor - セッション健全性の判定とスロットル

pub mod health;
pub mod throttle;

pub use health::{HealthMarkers, SessionHealth, classify};
pub use throttle::{Pause, Throttle, ThrottlePolicy, adaptive_range};
