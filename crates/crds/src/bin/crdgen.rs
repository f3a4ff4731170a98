//! Prints the CRD manifests for `kubectl apply -f -`.

use crds::{MetalMachine, PhysicalHost};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&PhysicalHost::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&MetalMachine::crd())?);
    Ok(())
}
