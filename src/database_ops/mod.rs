pub mod content;
pub mod db;
pub mod dedupe;
pub mod hike_ids;
pub mod inspect;
pub mod media_dedupe;
pub mod relink;
pub mod restore;
pub mod schema_ops;
pub mod snapshot;
pub mod transfer;
