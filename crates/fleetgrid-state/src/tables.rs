//! redb table definitions for the FleetGrid state store.

use redb::TableDefinition;

/// Registered instances keyed by `{service_name}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
