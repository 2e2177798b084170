use crate::{
    errors::{self, Error, Result},
    poll,
};
use aws_sdk_ec2::{
    operation::{describe_images::DescribeImagesError, describe_instances::DescribeInstancesError},
    types::{
        AttributeValue, BlockDeviceMapping, EbsBlockDevice, Filter, ImageState, Instance,
        InstanceStateName, InstanceType, Reservation, ResourceType, Tag, TagSpecification,
        Volume, VolumeType,
    },
    Client,
};
use aws_smithy_client::SdkError;
use aws_types::SdkConfig as AwsSdkConfig;

/// Default root device name of the launched instance.
pub const DEFAULT_DEVICE_NAME: &str = "/dev/sda1";

/// Implements AWS EC2 manager.
#[derive(Debug, Clone)]
pub struct Manager {
    pub region: String,
    pub cli: Client,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        Self {
            region: shared_config
                .region()
                .map(|r| r.to_string())
                .unwrap_or_default(),
            cli: Client::new(shared_config),
        }
    }

    /// Describes the only running instance with the "Name" tag.
    /// Fails if none or more than one instance matches.
    ///
    /// e.g.,
    /// aws ec2 describe-instances \
    /// --filters \
    ///   Name=tag:Name,Values=$NAME \
    ///   Name=instance-state-name,Values=running
    pub async fn describe_running_instance_by_name(&self, name: &str) -> Result<Instance> {
        log::info!("describing running instance with name '{}'", name);
        let resp = self
            .cli
            .describe_instances()
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed describe_instances {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;

        let instance = select_single_instance(resp.reservations().unwrap_or_default())?;
        log::info!(
            "found running instance '{}' for name '{}'",
            instance.instance_id().unwrap_or(""),
            name
        );
        Ok(instance)
    }

    /// Returns the current state of the instance.
    /// Returns "None" if the instance is not visible yet (eventual consistency).
    pub async fn describe_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceStateName>> {
        let ret = self
            .cli
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                if is_err_instance_not_found(&e) {
                    log::warn!("instance '{}' not found yet", instance_id);
                    return Ok(None);
                }
                return Err(Error::API {
                    message: format!("failed describe_instances {:?}", e),
                    retryable: errors::is_sdk_err_retryable(&e),
                });
            }
        };

        let instance = match select_single_instance(resp.reservations().unwrap_or_default()) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("instance '{}' not described yet ({})", instance_id, e);
                return Ok(None);
            }
        };
        Ok(instance.state().and_then(|s| s.name()).cloned())
    }

    /// Polls the instance until it reaches the desired state.
    /// Fails early if the instance enters a state it cannot leave for the desired one.
    pub async fn poll_instance_state(
        &self,
        instance_id: &str,
        desired: InstanceStateName,
        cfg: &poll::Config,
    ) -> Result<()> {
        let desc = format!("instance '{}' {}", instance_id, desired.as_str());
        let desired = &desired;
        poll::until(&desc, cfg, move || async move {
            let current = match self.describe_instance_state(instance_id).await? {
                Some(v) => v,
                None => return Ok(None),
            };
            log::info!(
                "instance '{}' is '{}' (desired '{}')",
                instance_id,
                current.as_str(),
                desired.as_str()
            );
            if check_instance_state(desired, &current)? {
                Ok(Some(()))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Describes a single EBS volume.
    pub async fn describe_volume(&self, volume_id: &str) -> Result<Volume> {
        log::info!("describing volume '{}'", volume_id);
        let resp = self
            .cli
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed describe_volumes {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;

        let volumes = resp.volumes().unwrap_or_default();
        if volumes.len() != 1 {
            return Err(Error::API {
                message: format!(
                    "expected only 1 volume from describe_volumes response but got {}",
                    volumes.len()
                ),
                retryable: false,
            });
        }
        Ok(volumes[0].clone())
    }

    /// Creates an AMI from the instance and returns the image Id.
    /// The caller is expected to poll the image state.
    pub async fn create_image(
        &self,
        instance_id: &str,
        image_name: &str,
        description: &str,
        no_reboot: bool,
    ) -> Result<String> {
        log::info!(
            "creating image '{}' from instance '{}' (no reboot {})",
            image_name,
            instance_id,
            no_reboot
        );
        let resp = self
            .cli
            .create_image()
            .instance_id(instance_id)
            .name(image_name)
            .description(description)
            .no_reboot(no_reboot)
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed create_image {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;

        let image_id = match resp.image_id() {
            Some(v) => v.to_string(),
            None => {
                return Err(Error::API {
                    message: String::from("empty image Id from create_image response"),
                    retryable: false,
                });
            }
        };
        log::info!("created image '{}' ({})", image_name, image_id);
        Ok(image_id)
    }

    /// Returns the current state of the image.
    /// Returns "None" if the image is not visible yet (eventual consistency).
    pub async fn describe_image_state(&self, image_id: &str) -> Result<Option<ImageState>> {
        let ret = self.cli.describe_images().image_ids(image_id).send().await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                if is_err_image_not_found(&e) {
                    log::warn!("image '{}' not found yet", image_id);
                    return Ok(None);
                }
                return Err(Error::API {
                    message: format!("failed describe_images {:?}", e),
                    retryable: errors::is_sdk_err_retryable(&e),
                });
            }
        };

        let images = resp.images().unwrap_or_default();
        if images.is_empty() {
            return Ok(None);
        }
        if images.len() != 1 {
            return Err(Error::API {
                message: format!(
                    "expected only 1 image from describe_images response but got {}",
                    images.len()
                ),
                retryable: false,
            });
        }
        Ok(images[0].state().cloned())
    }

    /// Polls the image until it is available.
    pub async fn poll_image_available(&self, image_id: &str, cfg: &poll::Config) -> Result<()> {
        let desc = format!("image '{}' available", image_id);
        poll::until(&desc, cfg, move || async move {
            let current = match self.describe_image_state(image_id).await? {
                Some(v) => v,
                None => return Ok(None),
            };
            log::info!("image '{}' is '{}'", image_id, current.as_str());
            if check_image_state(&current)? {
                Ok(Some(()))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Launches exactly one instance and returns its Id.
    /// The caller is expected to poll the instance state.
    pub async fn run_instance(&self, launch: &Launch) -> Result<String> {
        log::info!(
            "launching instance from image '{}' with type '{}' and {} GiB volume",
            launch.image_id,
            launch.instance_type,
            launch.volume_size
        );
        let resp = self
            .cli
            .run_instances()
            .image_id(&launch.image_id)
            .instance_type(InstanceType::from(launch.instance_type.as_str()))
            .set_key_name(launch.key_name.clone())
            .set_subnet_id(launch.subnet_id.clone())
            .min_count(1)
            .max_count(1)
            .block_device_mappings(launch.block_device_mapping())
            .set_security_group_ids(if launch.security_group_ids.is_empty() {
                None
            } else {
                Some(launch.security_group_ids.clone())
            })
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(Tag::builder().key("Name").value(&launch.name).build())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed run_instances {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;

        let instances = resp.instances().unwrap_or_default();
        if instances.len() != 1 {
            return Err(Error::API {
                message: format!(
                    "expected only 1 instance from run_instances response but got {}",
                    instances.len()
                ),
                retryable: false,
            });
        }
        let instance_id = match instances[0].instance_id() {
            Some(v) => v.to_string(),
            None => {
                return Err(Error::API {
                    message: String::from("empty instance Id from run_instances response"),
                    retryable: false,
                });
            }
        };

        log::info!("launched instance '{}'", instance_id);
        Ok(instance_id)
    }

    /// Stops the instance.
    /// The caller is expected to poll the instance state.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        log::info!("stopping instance '{}'", instance_id);
        self.cli
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed stop_instances {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;
        Ok(())
    }

    /// Starts the instance.
    /// The caller is expected to poll the instance state.
    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        log::info!("starting instance '{}'", instance_id);
        self.cli
            .start_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed start_instances {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;
        Ok(())
    }

    /// Changes the instance type of a stopped instance.
    pub async fn modify_instance_type(&self, instance_id: &str, instance_type: &str) -> Result<()> {
        log::info!(
            "changing instance type of '{}' to '{}'",
            instance_id,
            instance_type
        );
        self.cli
            .modify_instance_attribute()
            .instance_id(instance_id)
            .instance_type(AttributeValue::builder().value(instance_type).build())
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed modify_instance_attribute {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;
        Ok(())
    }
}

/// Represents the "run_instances" request for a replacement instance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Launch {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub device_name: String,
    pub volume_size: i32,
    pub volume_type: Option<VolumeType>,
    pub security_group_ids: Vec<String>,
    /// Subnet of the original instance; the security groups belong to its VPC.
    pub subnet_id: Option<String>,
    /// Value of the "Name" tag.
    pub name: String,
}

impl Launch {
    /// Builds the launch request for a copy of "instance" from "image_id",
    /// with the size and type of its root "volume".
    pub fn from_instance(
        instance: &Instance,
        volume: &Volume,
        image_id: &str,
        instance_type: &str,
        device_name: &str,
        name: &str,
    ) -> Result<Self> {
        let volume_size = match volume.size() {
            Some(v) => v,
            None => {
                return Err(Error::API {
                    message: format!(
                        "volume '{}' has no size",
                        volume.volume_id().unwrap_or("")
                    ),
                    retryable: false,
                });
            }
        };

        Ok(Self {
            image_id: String::from(image_id),
            instance_type: String::from(instance_type),
            key_name: instance.key_name().map(String::from),
            device_name: String::from(device_name),
            volume_size,
            volume_type: volume.volume_type().cloned(),
            security_group_ids: security_group_ids(instance),
            subnet_id: instance.subnet_id().map(String::from),
            name: String::from(name),
        })
    }

    pub fn block_device_mapping(&self) -> BlockDeviceMapping {
        BlockDeviceMapping::builder()
            .device_name(&self.device_name)
            .ebs(
                EbsBlockDevice::builder()
                    .delete_on_termination(true)
                    .volume_size(self.volume_size)
                    .set_volume_type(self.volume_type.clone())
                    .build(),
            )
            .build()
    }
}

/// Returns the only instance in the reservations.
pub fn select_single_instance(reservations: &[Reservation]) -> Result<Instance> {
    if reservations.len() != 1 {
        return Err(Error::Other {
            message: format!("expected only 1 reservation but got {}", reservations.len()),
            retryable: false,
        });
    }
    let instances = reservations[0].instances().unwrap_or_default();
    if instances.len() != 1 {
        return Err(Error::Other {
            message: format!("expected only 1 instance but got {}", instances.len()),
            retryable: false,
        });
    }
    Ok(instances[0].clone())
}

/// Returns the value of the "Name" tag, if any.
pub fn name_tag(instance: &Instance) -> Option<String> {
    instance
        .tags()
        .unwrap_or_default()
        .iter()
        .find(|t| t.key() == Some("Name"))
        .and_then(|t| t.value())
        .map(String::from)
}

/// Returns the EBS volume Id attached at "device_name".
/// Falls back to the first block device mapping.
pub fn root_volume_id(instance: &Instance, device_name: &str) -> Option<String> {
    let mappings = instance.block_device_mappings().unwrap_or_default();
    let mapping = mappings
        .iter()
        .find(|m| m.device_name() == Some(device_name))
        .or_else(|| mappings.first())?;
    mapping
        .ebs()
        .and_then(|ebs| ebs.volume_id())
        .map(String::from)
}

/// Returns the security group Ids of the instance.
pub fn security_group_ids(instance: &Instance) -> Vec<String> {
    instance
        .security_groups()
        .unwrap_or_default()
        .iter()
        .filter_map(|g| g.group_id())
        .map(String::from)
        .collect()
}

/// Returns true if the instance reached the desired state,
/// false to keep polling, or an error if it can no longer get there.
pub fn check_instance_state(
    desired: &InstanceStateName,
    current: &InstanceStateName,
) -> Result<bool> {
    if current.eq(desired) {
        return Ok(true);
    }

    let terminal = match desired {
        InstanceStateName::Running => matches!(
            current,
            InstanceStateName::ShuttingDown
                | InstanceStateName::Terminated
                | InstanceStateName::Stopping
        ),
        InstanceStateName::Stopped => matches!(
            current,
            InstanceStateName::Pending | InstanceStateName::Terminated
        ),
        _ => false,
    };
    if terminal {
        return Err(Error::Other {
            message: format!(
                "instance entered '{}' while waiting for '{}'",
                current.as_str(),
                desired.as_str()
            ),
            retryable: false,
        });
    }
    Ok(false)
}

/// Returns true if the image is available,
/// false to keep polling, or an error if the image creation failed.
pub fn check_image_state(current: &ImageState) -> Result<bool> {
    match current {
        ImageState::Available => Ok(true),
        ImageState::Failed
        | ImageState::Error
        | ImageState::Invalid
        | ImageState::Deregistered => Err(Error::Other {
            message: format!("image entered '{}'", current.as_str()),
            retryable: false,
        }),
        _ => Ok(false),
    }
}

#[inline]
fn is_err_instance_not_found(e: &SdkError<DescribeInstancesError>) -> bool {
    match e {
        SdkError::ServiceError(err) => is_instance_not_found_code(err.err().meta().code()),
        _ => false,
    }
}

#[inline]
fn is_err_image_not_found(e: &SdkError<DescribeImagesError>) -> bool {
    match e {
        SdkError::ServiceError(err) => is_image_not_found_code(err.err().meta().code()),
        _ => false,
    }
}

/// Newly launched instances are not visible to "describe_instances" right away.
pub fn is_instance_not_found_code(code: Option<&str>) -> bool {
    code == Some("InvalidInstanceID.NotFound")
}

/// Newly created images are not visible to "describe_images" right away.
pub fn is_image_not_found_code(code: Option<&str>) -> bool {
    code == Some("InvalidAMIID.NotFound")
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::{
        EbsInstanceBlockDevice, GroupIdentifier, InstanceBlockDeviceMapping,
    };

    fn instance(id: &str) -> Instance {
        Instance::builder()
            .instance_id(id)
            .key_name("ops")
            .subnet_id("subnet-1")
            .tags(Tag::builder().key("env").value("prod").build())
            .tags(Tag::builder().key("Name").value("web").build())
            .block_device_mappings(
                InstanceBlockDeviceMapping::builder()
                    .device_name("/dev/xvdb")
                    .ebs(EbsInstanceBlockDevice::builder().volume_id("vol-data").build())
                    .build(),
            )
            .block_device_mappings(
                InstanceBlockDeviceMapping::builder()
                    .device_name("/dev/sda1")
                    .ebs(EbsInstanceBlockDevice::builder().volume_id("vol-root").build())
                    .build(),
            )
            .security_groups(GroupIdentifier::builder().group_id("sg-1").build())
            .security_groups(GroupIdentifier::builder().group_name("no-id").build())
            .build()
    }

    /// RUST_LOG=debug cargo test --package ec2-swap --lib -- ec2::tests::test_select_single_instance --exact --show-output
    #[test]
    fn test_select_single_instance() {
        let _ = env_logger::builder().is_test(true).try_init();

        assert!(select_single_instance(&[]).is_err());

        let one = Reservation::builder().instances(instance("i-1")).build();
        let selected = select_single_instance(&[one.clone()]).unwrap();
        assert_eq!(selected.instance_id(), Some("i-1"));

        let two_reservations = vec![one.clone(), one];
        assert!(select_single_instance(&two_reservations).is_err());

        let two_instances = Reservation::builder()
            .instances(instance("i-1"))
            .instances(instance("i-2"))
            .build();
        let e = select_single_instance(&[two_instances]).unwrap_err();
        assert!(!e.retryable());
        assert!(e.message().contains("got 2"));

        let empty = Reservation::builder().build();
        assert!(select_single_instance(&[empty]).is_err());
    }

    #[test]
    fn test_instance_fields() {
        let inst = instance("i-1");
        assert_eq!(name_tag(&inst), Some(String::from("web")));
        assert_eq!(name_tag(&Instance::builder().build()), None);

        assert_eq!(
            root_volume_id(&inst, DEFAULT_DEVICE_NAME),
            Some(String::from("vol-root"))
        );
        assert_eq!(
            root_volume_id(&inst, "/dev/xvda"),
            Some(String::from("vol-data"))
        );
        assert_eq!(root_volume_id(&Instance::builder().build(), "/dev/sda1"), None);

        assert_eq!(security_group_ids(&inst), vec![String::from("sg-1")]);
    }

    #[test]
    fn test_check_instance_state() {
        let running = InstanceStateName::Running;
        let stopped = InstanceStateName::Stopped;

        assert!(check_instance_state(&running, &InstanceStateName::Running).unwrap());
        assert!(!check_instance_state(&running, &InstanceStateName::Pending).unwrap());
        assert!(check_instance_state(&running, &InstanceStateName::Terminated).is_err());
        assert!(check_instance_state(&running, &InstanceStateName::Stopping).is_err());
        assert!(check_instance_state(&running, &InstanceStateName::ShuttingDown).is_err());

        assert!(check_instance_state(&stopped, &InstanceStateName::Stopped).unwrap());
        assert!(!check_instance_state(&stopped, &InstanceStateName::Stopping).unwrap());
        assert!(!check_instance_state(&stopped, &InstanceStateName::Running).unwrap());
        assert!(check_instance_state(&stopped, &InstanceStateName::Pending).is_err());
        assert!(check_instance_state(&stopped, &InstanceStateName::Terminated).is_err());
    }

    #[test]
    fn test_check_image_state() {
        assert!(check_image_state(&ImageState::Available).unwrap());
        assert!(!check_image_state(&ImageState::Pending).unwrap());
        assert!(check_image_state(&ImageState::Failed).is_err());
        assert!(check_image_state(&ImageState::Error).is_err());
    }

    #[test]
    fn test_not_found_codes() {
        assert!(is_instance_not_found_code(Some("InvalidInstanceID.NotFound")));
        assert!(!is_instance_not_found_code(Some("InvalidInstanceID.Malformed")));
        assert!(!is_instance_not_found_code(Some("InvalidAMIID.NotFound")));
        assert!(!is_instance_not_found_code(None));

        assert!(is_image_not_found_code(Some("InvalidAMIID.NotFound")));
        assert!(!is_image_not_found_code(Some("InvalidAMIID.Unavailable")));
        assert!(!is_image_not_found_code(Some("InvalidInstanceID.NotFound")));
        assert!(!is_image_not_found_code(None));
    }

    /// RUST_LOG=debug cargo test --package ec2-swap --lib -- ec2::tests::test_launch_from_instance --exact --show-output
    #[test]
    fn test_launch_from_instance() {
        let _ = env_logger::builder().is_test(true).try_init();

        let volume = Volume::builder()
            .volume_id("vol-root")
            .size(30)
            .volume_type(VolumeType::Gp3)
            .build();
        let launch = Launch::from_instance(
            &instance("i-1"),
            &volume,
            "ami-1",
            "t2.micro",
            DEFAULT_DEVICE_NAME,
            "web",
        )
        .unwrap();
        assert_eq!(
            launch,
            Launch {
                image_id: String::from("ami-1"),
                instance_type: String::from("t2.micro"),
                key_name: Some(String::from("ops")),
                device_name: String::from("/dev/sda1"),
                volume_size: 30,
                volume_type: Some(VolumeType::Gp3),
                security_group_ids: vec![String::from("sg-1")],
                subnet_id: Some(String::from("subnet-1")),
                name: String::from("web"),
            }
        );

        // default VPC instances carry no subnet; let EC2 pick one
        let bare = Instance::builder().instance_id("i-2").build();
        let launch =
            Launch::from_instance(&bare, &volume, "ami-1", "t2.micro", "/dev/sda1", "web")
                .unwrap();
        assert_eq!(launch.subnet_id, None);
        assert!(launch.security_group_ids.is_empty());
        assert_eq!(launch.key_name, None);

        let no_size = Volume::builder().volume_id("vol-root").build();
        let e = Launch::from_instance(&bare, &no_size, "ami-1", "t2.micro", "/dev/sda1", "web")
            .unwrap_err();
        assert!(e.message().contains("vol-root"));
        assert!(!e.retryable());
    }

    #[test]
    fn test_launch_block_device_mapping() {
        let launch = Launch {
            image_id: String::from("ami-1"),
            instance_type: String::from("t2.micro"),
            key_name: Some(String::from("ops")),
            device_name: String::from(DEFAULT_DEVICE_NAME),
            volume_size: 30,
            volume_type: Some(VolumeType::Gp3),
            security_group_ids: vec![String::from("sg-1")],
            subnet_id: Some(String::from("subnet-1")),
            name: String::from("web"),
        };
        let mapping = launch.block_device_mapping();
        assert_eq!(mapping.device_name(), Some("/dev/sda1"));
        let ebs = mapping.ebs().unwrap();
        assert_eq!(ebs.volume_size(), Some(30));
        assert_eq!(ebs.delete_on_termination(), Some(true));
        assert_eq!(ebs.volume_type(), Some(&VolumeType::Gp3));
    }
}
