//! Core domain models shared across the routing core and its persistence
//! backend — the entities enumerated in §3.1.

pub mod device;
pub mod group;
pub mod message;
pub mod prekey;
pub mod user;

pub use device::*;
pub use group::*;
pub use message::*;
pub use prekey::*;
pub use user::*;
