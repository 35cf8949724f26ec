//! CRD YAML Generator
//!
//! Prints the manifests of every custom resource owned by the operator.
//! The APIManager CRD belongs to the installer and is not included.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use threescale_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
