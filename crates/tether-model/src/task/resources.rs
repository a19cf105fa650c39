use serde::{Deserialize, Serialize};

/// Named network port. A dynamic port with `value == 0` is assigned at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub label: String,
    pub value: u16,
}

impl Port {
    pub fn new(label: impl Into<String>, value: u16) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// Ports requested on one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResource {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_ports: Vec<Port>,
}

impl NetworkResource {
    /// Reserved ports first, then dynamic ones.
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.reserved_ports.iter().chain(self.dynamic_ports.iter())
    }
}

/// Resources requested by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// CPU shares (MHz-like relative weight).
    pub cpu: u32,
    /// Memory ceiling in MB.
    pub memory_mb: u64,
    /// Disk size in MB.
    #[serde(default)]
    pub disk_mb: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkResource>,
}
