use prometheus_client::registry::Registry;

/// Creates a metrics sub registry for ephemos.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("ephemos")
}
