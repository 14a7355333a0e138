pub mod assets;
pub mod build_info;
pub mod msg_store;
pub mod path;
pub mod session_lock;
