use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let resources = [
        network_operator::resources::Device::crd(),
        network_operator::resources::Interface::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }

    Ok(())
}
