pub mod errors;
pub mod poll;

#[cfg(feature = "ec2")]
pub mod ec2;

#[cfg(feature = "elbv2")]
pub mod elbv2;

#[cfg(feature = "swap")]
pub mod swap;

#[cfg(feature = "ec2")]
pub mod utils;

use aws_config::{self, meta::region::RegionProviderChain};
use aws_types::{region::Region, SdkConfig as AwsSdkConfig};

/// Loads an AWS config from default environments.
pub async fn load_config(region: Option<String>, profile_name: Option<String>) -> AwsSdkConfig {
    log::info!("loading config for the region {:?}", region);

    // if region is None, it automatically detects iff it's running inside the EC2 instance
    let reg_provider = RegionProviderChain::first_try(region.map(Region::new))
        .or_default_provider()
        .or_else(Region::new("us-west-2"));

    let mut loader = aws_config::from_env().region(reg_provider);
    if let Some(p) = profile_name {
        log::info!("loading the aws profile '{p}'");
        loader = loader.profile_name(p);
    }

    loader.load().await
}
