//! Print the PoolUnit custom resource definition.

use anyhow::Context;
use anyhow::Result;
use api_types::PoolUnit;
use kube::CustomResourceExt;

pub fn run() -> Result<()> {
    let crd = PoolUnit::crd();
    let yaml = serde_yaml::to_string(&crd).context("serialize CRD to YAML")?;
    println!("{yaml}");
    Ok(())
}
