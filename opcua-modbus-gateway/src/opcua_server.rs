//! Embedded OPC UA server exposing the tag variables.
//!
//! The server runs async-opcua's in-memory node manager with one custom
//! hook: client writes to a variable's Value attribute are type-checked,
//! stored, and announced to subscribers. The engine reads those writes back
//! from a shared value store on its next cycle.

use dashmap::{DashMap, DashSet};
use opcua::{
    crypto::SecurityPolicy,
    nodes::NodeType,
    server::{
        ANONYMOUS_USER_TOKEN_ID, Server, ServerBuilder, ServerHandle,
        address_space::{AccessLevel, AddressSpace as OpcuaNodes, ObjectBuilder, VariableBuilder},
        diagnostics::NamespaceMetadata,
        node_manager::{
            RequestContext, ServerContext, WriteNode,
            memory::{InMemoryNodeManager, InMemoryNodeManagerBuilder, InMemoryNodeManagerImpl},
        },
    },
    sync::RwLock,
    types::{
        AttributeId, DataValue, MessageSecurityMode, NodeId, ObjectId, StatusCode, Variant,
    },
};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::config::OpcuaServerConfig;
use crate::value::{TagValue, data_type_id};

/// Error type for the embedded server.
#[derive(Debug, Error)]
pub enum OpcuaServerError {
    #[error("Invalid OPC UA server configuration: {0}")]
    Config(String),
    #[error("Failed to build OPC UA server: {0}")]
    Build(String),
    #[error("Gateway node manager is not registered")]
    NodeManager,
    #[error("OPC UA server stopped: {0}")]
    Stopped(String),
}

type GatewayNodeManager = InMemoryNodeManager<GatewayNodeManagerImpl>;

/// Current value and access of one variable.
#[derive(Debug, Clone, Copy)]
struct VariableSlot {
    value: TagValue,
    writable: bool,
}

type ValueStore = Arc<DashMap<NodeId, VariableSlot>>;

struct GatewayNodeManagerImpl {
    namespaces: Vec<NamespaceMetadata>,
    values: ValueStore,
}

/// Validate a client write against the variable it targets.
fn accept_client_write(
    slot: Option<&VariableSlot>,
    attribute_id: AttributeId,
    variant: Option<&Variant>,
) -> Result<TagValue, StatusCode> {
    if attribute_id != AttributeId::Value {
        return Err(StatusCode::BadNotWritable);
    }
    let slot = slot.ok_or(StatusCode::BadNodeIdUnknown)?;
    if !slot.writable {
        return Err(StatusCode::BadNotWritable);
    }
    let variant = variant.ok_or(StatusCode::BadNothingToDo)?;
    TagValue::from_variant(variant, slot.value.semantic_type()).ok_or(StatusCode::BadTypeMismatch)
}

#[async_trait::async_trait]
impl InMemoryNodeManagerImpl for GatewayNodeManagerImpl {
    async fn init(&self, _address_space: &mut OpcuaNodes, _context: ServerContext) {}

    fn name(&self) -> &str {
        "opcua-modbus-gateway"
    }

    fn namespaces(&self) -> Vec<NamespaceMetadata> {
        self.namespaces.clone()
    }

    async fn write(
        &self,
        context: &RequestContext,
        address_space: &RwLock<OpcuaNodes>,
        nodes_to_write: &mut [&mut WriteNode],
    ) -> Result<(), StatusCode> {
        for write in nodes_to_write.iter_mut() {
            let w = write.value();
            let node_id = w.node_id.clone();
            let attribute_id = w.attribute_id;
            let variant = w.value.value.clone();

            // Slot stays locked until the address space reflects the write
            let mut slot = self.values.get_mut(&node_id);
            let value = match accept_client_write(slot.as_deref(), attribute_id, variant.as_ref())
            {
                Ok(value) => value,
                Err(status) => {
                    debug!(node = %node_id, ?status, "Rejected client write");
                    write.set_status(status);
                    continue;
                }
            };

            let dv = DataValue::new_now(value.to_variant());
            {
                let mut nodes = address_space.write();
                if let Some(NodeType::Variable(v)) = nodes.find_mut(&node_id) {
                    v.set_data_value(dv.clone());
                }
            }
            context
                .subscriptions
                .notify_data_change([(dv, &node_id, AttributeId::Value)].into_iter());

            if let Some(slot) = slot.as_deref_mut() {
                slot.value = value;
            }
            info!(node = %node_id, %value, "OPC UA client write");
            write.set_status(StatusCode::Good);
        }

        Ok(())
    }
}

/// [`AddressSpace`] backed by the running server's node manager.
#[derive(Clone)]
pub struct OpcuaAddressSpace {
    handle: ServerHandle,
    node_manager: Arc<GatewayNodeManager>,
    namespace_index: u16,
    values: ValueStore,
    objects: Arc<DashSet<NodeId>>,
    /// Objects take numeric ids so they never clash with variable names.
    next_object_id: Arc<AtomicU32>,
}

impl OpcuaAddressSpace {
    pub fn namespace_index(&self) -> u16 {
        self.namespace_index
    }

    fn check_parent(&self, parent: &NodeId) -> Result<(), AddressSpaceError> {
        if *parent == self.root() || self.objects.contains(parent) {
            Ok(())
        } else {
            Err(AddressSpaceError::UnknownNode(parent.to_string()))
        }
    }
}

impl AddressSpace for OpcuaAddressSpace {
    fn root(&self) -> NodeId {
        ObjectId::ObjectsFolder.into()
    }

    fn add_object(&self, parent: &NodeId, name: &str) -> Result<NodeId, AddressSpaceError> {
        self.check_parent(parent)?;
        let id = NodeId::new(
            self.namespace_index,
            self.next_object_id.fetch_add(1, Ordering::SeqCst),
        );

        let mut nodes = self.node_manager.address_space().write();
        if nodes.node_exists(&id) {
            return Err(AddressSpaceError::DuplicateNode(id.to_string()));
        }
        let inserted = ObjectBuilder::new(&id, name, name)
            .organized_by(parent.clone())
            .insert(&mut *nodes);
        if !inserted {
            return Err(AddressSpaceError::Server(format!(
                "Failed to insert object {}",
                id
            )));
        }

        drop(nodes);
        self.objects.insert(id.clone());
        Ok(id)
    }

    fn add_variable(
        &self,
        parent: &NodeId,
        name: &str,
        initial: TagValue,
        writable: bool,
    ) -> Result<NodeId, AddressSpaceError> {
        self.check_parent(parent)?;
        let id = NodeId::new(self.namespace_index, name.to_string());
        let access = if writable {
            AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE
        } else {
            AccessLevel::CURRENT_READ
        };

        let mut nodes = self.node_manager.address_space().write();
        if nodes.node_exists(&id) {
            return Err(AddressSpaceError::DuplicateNode(id.to_string()));
        }
        let inserted = VariableBuilder::new(&id, name, name)
            .data_type(data_type_id(initial.semantic_type()))
            .value(initial.to_variant())
            .access_level(access)
            .user_access_level(access)
            .organized_by(parent.clone())
            .insert(&mut *nodes);
        if !inserted {
            return Err(AddressSpaceError::Server(format!(
                "Failed to insert variable {}",
                id
            )));
        }
        drop(nodes);

        self.values.insert(
            id.clone(),
            VariableSlot {
                value: initial,
                writable,
            },
        );
        Ok(id)
    }

    fn get_value(&self, node: &NodeId) -> Result<TagValue, AddressSpaceError> {
        self.values
            .get(node)
            .map(|slot| slot.value)
            .ok_or_else(|| AddressSpaceError::UnknownNode(node.to_string()))
    }

    fn set_value(&self, node: &NodeId, value: TagValue) -> Result<(), AddressSpaceError> {
        let mut slot = self
            .values
            .get_mut(node)
            .ok_or_else(|| AddressSpaceError::UnknownNode(node.to_string()))?;
        if slot.value.semantic_type() != value.semantic_type() {
            return Err(AddressSpaceError::TypeMismatch {
                node: node.to_string(),
                expected: slot.value.semantic_type(),
                actual: value.semantic_type(),
            });
        }

        self.node_manager
            .set_value(
                self.handle.subscriptions(),
                node,
                None,
                DataValue::new_now(value.to_variant()),
            )
            .map_err(|status| AddressSpaceError::Server(format!("{}: {:?}", node, status)))?;
        slot.value = value;
        Ok(())
    }
}

/// The embedded server. It is built first, populated, then started.
///
/// Dropping it cancels the server's token.
pub struct OpcuaServer {
    server: Option<Server>,
    space: OpcuaAddressSpace,
    token: CancellationToken,
    task: Option<JoinHandle<Result<(), String>>>,
    endpoint_url: String,
}

impl OpcuaServer {
    /// Build the server and register the gateway namespace. Nothing listens yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(
        config: &OpcuaServerConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, OpcuaServerError> {
        if config.port == 0 {
            return Err(OpcuaServerError::Config(
                "invalid port: must be in range 1..=65535".to_string(),
            ));
        }
        if !config.endpoint_path.starts_with('/') {
            return Err(OpcuaServerError::Config(format!(
                "endpoint_path '{}' must start with '/'",
                config.endpoint_path
            )));
        }

        let token = shutdown.child_token();
        let values: ValueStore = Arc::new(DashMap::new());
        let namespace_uri = config.namespace_uri.clone();
        let values_for_nm = Arc::clone(&values);
        let user_token_ids: &[&str] = &[ANONYMOUS_USER_TOKEN_ID];
        let discovery_urls = discovery_urls(&config.host, config.port, &config.endpoint_path);
        let endpoint_url = discovery_urls.first().cloned().unwrap_or_default();

        let (server, handle) = ServerBuilder::new()
            .application_name(config.application_name.clone())
            .application_uri(config.application_uri.clone())
            .product_uri(config.application_uri.clone())
            .create_sample_keypair(true)
            .certificate_path("own/cert.der")
            .private_key_path("private/private.pem")
            .pki_dir(config.pki_dir.clone())
            .host(config.host.clone())
            .port(config.port)
            .discovery_urls(discovery_urls)
            .add_endpoint(
                "none",
                (
                    config.endpoint_path.as_str(),
                    SecurityPolicy::None,
                    MessageSecurityMode::None,
                    user_token_ids,
                ),
            )
            .default_endpoint("none")
            .with_node_manager(InMemoryNodeManagerBuilder::new(
                move |context: ServerContext, address_space: &mut OpcuaNodes| {
                    let namespace_index = {
                        let mut type_tree = context.type_tree.write();
                        type_tree
                            .namespaces_mut()
                            .add_namespace(namespace_uri.as_str())
                    };
                    address_space.add_namespace(&namespace_uri, namespace_index);

                    GatewayNodeManagerImpl {
                        namespaces: vec![NamespaceMetadata {
                            namespace_uri: namespace_uri.clone(),
                            namespace_index,
                            ..Default::default()
                        }],
                        values: Arc::clone(&values_for_nm),
                    }
                },
            ))
            .token(token.clone())
            .build()
            .map_err(OpcuaServerError::Build)?;

        let node_manager = handle
            .node_managers()
            .get_of_type::<GatewayNodeManager>()
            .ok_or(OpcuaServerError::NodeManager)?;
        let namespace_index = handle
            .get_namespace_index(&config.namespace_uri)
            .ok_or(OpcuaServerError::NodeManager)?;

        info!(
            namespace = %config.namespace_uri,
            namespace_index,
            "OPC UA server built"
        );

        Ok(Self {
            server: Some(server),
            space: OpcuaAddressSpace {
                handle,
                node_manager,
                namespace_index,
                values,
                objects: Arc::new(DashSet::new()),
                next_object_id: Arc::new(AtomicU32::new(1)),
            },
            token,
            task: None,
            endpoint_url,
        })
    }

    /// Handle for populating and synchronizing the address space.
    pub fn address_space(&self) -> OpcuaAddressSpace {
        self.space.clone()
    }

    /// Start serving in a background task. Calling it again has no effect.
    pub fn start(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };

        info!(endpoint = %self.endpoint_url, "Starting OPC UA server");
        self.task = Some(tokio::spawn(server.run()));
    }

    /// Wait for the server task to end without being asked to.
    ///
    /// A server that fails to bind ends here with an error. Pends forever
    /// while the server has not been started.
    pub async fn wait(&mut self) -> Result<(), OpcuaServerError> {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let result = task.await;
        self.task = None;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(OpcuaServerError::Stopped(e)),
            Err(e) => Err(OpcuaServerError::Stopped(e.to_string())),
        }
    }

    /// Cancel the server and wait for it to finish.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "OPC UA server stopped with error"),
                Err(e) => warn!(error = %e, "OPC UA server task failed"),
            }
            info!("OPC UA server stopped");
        }
    }
}

impl Drop for OpcuaServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// URLs advertised to discovering clients.
///
/// The server refuses an empty list. Clients cannot dial a wildcard address,
/// so a bind-all host advertises the loopback names of its family instead.
fn discovery_urls(host: &str, port: u16, endpoint_path: &str) -> Vec<String> {
    let url = |authority: &str| format!("opc.tcp://{authority}:{port}{endpoint_path}");
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) if ip.is_unspecified() => vec![url("localhost"), url("127.0.0.1")],
        Ok(IpAddr::V6(ip)) if ip.is_unspecified() => vec![url("localhost"), url("[::1]")],
        Ok(IpAddr::V6(ip)) => vec![url(&format!("[{ip}]"))],
        _ => vec![url(host)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::SemanticType;

    fn slot(value: TagValue, writable: bool) -> VariableSlot {
        VariableSlot { value, writable }
    }

    #[test]
    fn test_discovery_urls_for_wildcard_host() {
        let urls = discovery_urls("0.0.0.0", 4840, "/rpi_server/");
        assert_eq!(urls[0], "opc.tcp://localhost:4840/rpi_server/");
        assert!(urls.iter().any(|u| u.contains("127.0.0.1:4840")));
    }

    #[test]
    fn test_discovery_urls_for_plain_host() {
        let urls = discovery_urls("192.168.1.10", 4840, "/");
        assert_eq!(urls, vec!["opc.tcp://192.168.1.10:4840/".to_string()]);
    }

    #[test]
    fn test_discovery_urls_bracket_ipv6() {
        let urls = discovery_urls("::1", 4841, "/");
        assert_eq!(urls, vec!["opc.tcp://[::1]:4841/".to_string()]);
    }

    #[test]
    fn test_discovery_urls_for_ipv6_wildcard_host() {
        let urls = discovery_urls("::", 4840, "/");
        assert_eq!(
            urls,
            vec![
                "opc.tcp://localhost:4840/".to_string(),
                "opc.tcp://[::1]:4840/".to_string(),
            ]
        );
        assert_eq!(discovery_urls("0:0:0:0:0:0:0:0", 4840, "/"), urls);
    }

    #[test]
    fn test_client_write_accepted() {
        let target = slot(TagValue::Int16(0), true);
        let value = accept_client_write(
            Some(&target),
            AttributeId::Value,
            Some(&Variant::Int16(12)),
        );
        assert_eq!(value, Ok(TagValue::Int16(12)));
    }

    #[test]
    fn test_client_write_rejections() {
        let writable = slot(TagValue::Boolean(false), true);
        let read_only = slot(TagValue::Boolean(false), false);
        let on = Variant::Boolean(true);

        assert_eq!(
            accept_client_write(Some(&writable), AttributeId::DisplayName, Some(&on)),
            Err(StatusCode::BadNotWritable)
        );
        assert_eq!(
            accept_client_write(Some(&read_only), AttributeId::Value, Some(&on)),
            Err(StatusCode::BadNotWritable)
        );
        assert_eq!(
            accept_client_write(None, AttributeId::Value, Some(&on)),
            Err(StatusCode::BadNodeIdUnknown)
        );
        assert_eq!(
            accept_client_write(Some(&writable), AttributeId::Value, Some(&Variant::Int32(1))),
            Err(StatusCode::BadTypeMismatch)
        );
        assert_eq!(
            accept_client_write(Some(&writable), AttributeId::Value, None),
            Err(StatusCode::BadNothingToDo)
        );
    }

    #[test]
    fn test_build_rejects_bad_endpoint_path() {
        let config = OpcuaServerConfig {
            endpoint_path: "rpi_server".to_string(),
            ..Default::default()
        };
        let err = OpcuaServer::build(&config, &CancellationToken::new()).err();
        assert!(matches!(err, Some(OpcuaServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_address_space_round_trip() {
        let pki = tempfile::tempdir().unwrap();
        let config = OpcuaServerConfig {
            host: "127.0.0.1".to_string(),
            port: 48_401,
            pki_dir: pki.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let shutdown = CancellationToken::new();
        let server = OpcuaServer::build(&config, &shutdown).unwrap();
        let space = server.address_space();
        let ns = space.namespace_index();

        let plc = space.add_object(&space.root(), "Plc").unwrap();
        let line = space.add_object(&plc, "Line1").unwrap();
        assert_ne!(plc, line);
        assert_eq!(line.namespace, ns);

        let speed = space
            .add_variable(&line, "Speed", TagValue::Int16(0), true)
            .unwrap();
        assert_eq!(speed, NodeId::new(ns, "Speed"));

        space.set_value(&speed, TagValue::Int16(-4)).unwrap();
        assert_eq!(space.get_value(&speed).unwrap(), TagValue::Int16(-4));

        assert!(matches!(
            space.set_value(&speed, TagValue::Float(1.0)),
            Err(AddressSpaceError::TypeMismatch {
                expected: SemanticType::Int16,
                ..
            })
        ));
        assert!(matches!(
            space.add_variable(&plc, "Speed", TagValue::Int16(0), false),
            Err(AddressSpaceError::DuplicateNode(_))
        ));
        assert!(matches!(
            space.add_object(&NodeId::new(ns, "Missing"), "X"),
            Err(AddressSpaceError::UnknownNode(_))
        ));

        // A variable may share its name with an object
        let same_name = space
            .add_variable(&line, "Line1", TagValue::Boolean(false), false)
            .unwrap();
        assert_ne!(same_name, line);

        // The server's token is a child; dropping it leaves the caller's token alone
        drop(server);
        assert!(!shutdown.is_cancelled());
    }
}
