//! Prints the NicClusterPolicy CustomResourceDefinition as YAML.
//!
//! `cargo run -p crds --bin crdgen > config/crd/nicclusterpolicy.yaml`

use crds::NicClusterPolicy;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&NicClusterPolicy::crd())?);
    Ok(())
}
