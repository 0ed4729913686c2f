// src/vmm/template.rs

use driver_protocol::payload::xml_escape;
use serde::{Deserialize, Serialize};

use crate::driver::DriverKind;

/// What a driver needs to know to deploy a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: i64,
    pub name: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    /// Full VM document, sent untouched to `xml` and `generic` drivers.
    #[serde(default)]
    pub xml: String,
}

impl VmTemplate {
    /// Deployment description in the dialect of `kind`.
    pub fn render(&self, kind: DriverKind) -> String {
        match kind {
            DriverKind::Generic | DriverKind::Xml => self.xml.clone(),
            DriverKind::Libvirt => format!(
                "<domain type='kvm'><name>one-{}</name><title>{}</title>\
                 <vcpu>{}</vcpu><memory unit='MiB'>{}</memory></domain>",
                self.id,
                xml_escape(&self.name),
                self.vcpu,
                self.memory_mb,
            ),
            DriverKind::Xen => format!(
                "name = \"one-{}\"\nvcpus = {}\nmemory = {}\n",
                self.id, self.vcpu, self.memory_mb,
            ),
        }
    }
}
