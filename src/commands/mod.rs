pub mod health;
pub mod reconciler;
