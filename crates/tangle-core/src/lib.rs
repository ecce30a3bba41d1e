pub mod hash;
pub mod peer_id;
pub mod timestamp;

pub use hash::{room_name_for_binary, stable_hash_hex};
pub use peer_id::{successor, PeerId};
pub use timestamp::{LocalOffset, SimTime, TimeStamp};
