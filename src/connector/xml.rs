//! Domain-XML templating (spec §6.5).
//!
//! A fixed template with holes, plus a programmatically inserted
//! `cputune`/`vcpupin` block. Kept as plain `format!` string-building
//! rather than a DOM tree — nothing downstream parses this XML back, it
//! only ever goes out to the hypervisor.

use crate::config::QemuConfig;
use crate::domain::DomainEntity;

const TEMPLATE: &str = r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{mem}</memory>
  <vcpu placement='static'>{cpu}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <source file='{loc}/{name}.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
  </devices>
  {cputune}
  <metadata>
    <hvsched:oversubscription xmlns:hvsched="hvsched">
      <cpu>{oc_cpu}</cpu>
      <mem>{oc_mem}</mem>
      <disk>1.0</disk>
      <network>1.0</network>
    </hvsched:oversubscription>
  </metadata>
</domain>"#;

/// Render the domain descriptor for a VM that is about to be created.
pub fn render_domain_xml(vm: &DomainEntity, qemu: &QemuConfig) -> String {
    let cputune = vm
        .cpu_pin()
        .map(render_cputune)
        .unwrap_or_default();
    TEMPLATE
        .replace("{name}", vm.name())
        .replace("{mem}", &vm.mem_kb().to_string())
        .replace("{cpu}", &vm.cpu().to_string())
        .replace("{machine}", &qemu.machine)
        .replace("{loc}", &qemu.loc)
        .replace("{cputune}", &cputune)
        .replace("{oc_cpu}", &vm.cpu_ratio().to_string())
        .replace("{oc_mem}", "1.0")
}

/// Build the `cputune`/`vcpupin` XML block: one `vcpupin` element per
/// vCPU, with a comma-separated cpuset listing every core it may run on.
pub fn render_cputune(cpu_pin: &crate::domain::CpuPin) -> String {
    let mut out = String::from("<cputune>\n");
    for (vcpu, mask) in cpu_pin.iter().enumerate() {
        let cpuset: Vec<String> = mask
            .iter()
            .enumerate()
            .filter(|(_, allowed)| **allowed)
            .map(|(cpu_id, _)| cpu_id.to_string())
            .collect();
        out.push_str(&format!(
            "    <vcpupin vcpu='{vcpu}' cpuset='{}'/>\n",
            cpuset.join(",")
        ));
    }
    out.push_str("  </cputune>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cputune_lists_allowed_cores() {
        let pin = vec![vec![false, true, true, false]];
        let xml = render_cputune(&pin);
        assert!(xml.contains("cpuset='1,2'"));
    }

    #[test]
    fn render_domain_xml_substitutes_holes() {
        let vm = DomainEntity::builder("vm-a", 1_048_576, 2, 1.0).build();
        let qemu = QemuConfig {
            url: "qemu:///system".into(),
            loc: "/var/lib/images".into(),
            machine: "q35".into(),
        };
        let xml = render_domain_xml(&vm, &qemu);
        assert!(xml.contains("<name>vm-a</name>"));
        assert!(xml.contains("machine='q35'"));
        assert!(xml.contains("/var/lib/images/vm-a.qcow2"));
    }
}
