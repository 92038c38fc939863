//! Friendly-ID minting: opaque, URL-safe external identifiers, distinct from
//! internal database keys.

use uuid::Uuid;

pub fn friendly_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
