use kube::CustomResourceExt;
use operator::{
    group_controller::NBGroup, policy_controller::NBPolicy, resource_controller::NBResource,
    routingpeer_controller::NBRoutingPeer, setupkey_controller::NBSetupKey,
};

use clap::Parser;
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // Output directory
    #[arg(short, long, default_value = ".")]
    output: String,
}

fn main() {
    let args = Args::parse();
    // Create directory if it does not exist
    std::fs::create_dir_all(&args.output).unwrap();
    std::fs::write(
        format!("{}/nbgroup.yaml", args.output),
        serde_yaml::to_string(&NBGroup::crd()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        format!("{}/nbresource.yaml", args.output),
        serde_yaml::to_string(&NBResource::crd()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        format!("{}/nbpolicy.yaml", args.output),
        serde_yaml::to_string(&NBPolicy::crd()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        format!("{}/nbroutingpeer.yaml", args.output),
        serde_yaml::to_string(&NBRoutingPeer::crd()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        format!("{}/nbsetupkey.yaml", args.output),
        serde_yaml::to_string(&NBSetupKey::crd()).unwrap(),
    )
    .unwrap();
}
