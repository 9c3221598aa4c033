//! CRD printing and installation
//!
//! The operator owns the restore CRD and the two snapshot CRDs it reads
//! from, so the installed schemas always match the binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use vmrestore_common::crd::{
    VirtualMachineRestore, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
};
use vmrestore_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn all_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: VirtualMachineRestore::crd_name(),
            crd: VirtualMachineRestore::crd(),
        },
        CrdDef {
            name: VirtualMachineSnapshot::crd_name(),
            crd: VirtualMachineSnapshot::crd(),
        },
        CrdDef {
            name: VirtualMachineSnapshotContent::crd_name(),
            crd: VirtualMachineSnapshotContent::crd(),
        },
    ]
}

/// All CRDs as a multi-document YAML stream
pub fn crd_yaml() -> anyhow::Result<String> {
    let mut out = String::new();
    for def in all_crds() {
        let doc = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}

/// Install or update all CRDs using server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in all_crds() {
        tracing::info!(crd = def.name, "installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("all CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_restore_and_snapshot_kinds() {
        let names: Vec<_> = all_crds().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "virtualmachinerestores.snapshot.kubevirt.io",
                "virtualmachinesnapshots.snapshot.kubevirt.io",
                "virtualmachinesnapshotcontents.snapshot.kubevirt.io",
            ]
        );
    }

    #[test]
    fn yaml_has_one_document_per_crd() {
        let yaml = crd_yaml().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 3);
        assert!(yaml.contains("kind: CustomResourceDefinition"));
        assert!(yaml.contains("VirtualMachineRestore"));
    }
}
