pub mod events;
pub mod presence;
