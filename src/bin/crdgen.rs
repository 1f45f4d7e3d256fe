//! Print the operator's CustomResourceDefinitions as a YAML stream.

use kube::CustomResourceExt;

use rabbitmq_operator::crd::{RabbitMQCustomResource, RabbitMQNetworkPartitionCustomResource};

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&RabbitMQCustomResource::crd())?);
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&RabbitMQNetworkPartitionCustomResource::crd())?
    );
    Ok(())
}
