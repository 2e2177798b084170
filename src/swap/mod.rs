//! Replaces a running EC2 instance behind an ELB target group with a
//! temporary copy, resizes the original, and swaps the traffic back.
//!
//! discover -> snapshot -> launch replacement -> cut over -> resize original -> cut back
//!
//! There is no rollback: a failure leaves the resources as they were at the
//! failed step.
pub mod prompt;

use std::future::Future;

use crate::{
    ec2, elbv2,
    errors::{Error, Result},
    poll,
    utils::time,
};
use aws_sdk_ec2::types::{Instance, InstanceStateName};
use aws_types::SdkConfig as AwsSdkConfig;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

pub use prompt::{InstanceTypePrompt, Interactive, NoPrompt};

/// Instance type of the temporary replacement when not specified.
pub const DEFAULT_REPLACEMENT_INSTANCE_TYPE: &str = "t2.micro";

/// Defines the swap options.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Options {
    /// Value of the "Name" tag of the running instance.
    pub instance_name: String,
    /// New instance type of the original instance.
    pub target_instance_type: String,
    /// Instance type of the temporary replacement.
    pub replacement_instance_type: String,

    /// Port of the registered targets.
    pub port: i32,
    /// Root device name of the replacement instance.
    pub device_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_description: Option<String>,
    /// Set "false" to let EC2 reboot the instance for a consistent file system.
    pub image_no_reboot: bool,

    pub poll_interval_seconds: u64,
    pub poll_max_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            instance_name: String::new(),
            target_instance_type: String::new(),
            replacement_instance_type: String::from(DEFAULT_REPLACEMENT_INSTANCE_TYPE),

            port: elbv2::DEFAULT_PORT,
            device_name: String::from(ec2::DEFAULT_DEVICE_NAME),

            image_description: None,
            image_no_reboot: true,

            poll_interval_seconds: poll::DEFAULT_INTERVAL.as_secs(),
            poll_max_attempts: poll::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Options {
    pub fn new(instance_name: &str, target_instance_type: &str) -> Self {
        Self {
            instance_name: String::from(instance_name),
            target_instance_type: String::from(target_instance_type),
            ..Default::default()
        }
    }

    pub fn poll_config(&self) -> poll::Config {
        poll::Config::new(
            Duration::from_secs(self.poll_interval_seconds),
            self.poll_max_attempts,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty() {
            return Err(invalid_option("empty instance name"));
        }
        if self.target_instance_type.is_empty() {
            return Err(invalid_option("empty target instance type"));
        }
        if self.replacement_instance_type.is_empty() {
            return Err(invalid_option("empty replacement instance type"));
        }
        if self.port <= 0 || self.port > 65535 {
            return Err(invalid_option(&format!("invalid port {}", self.port)));
        }
        if self.poll_max_attempts == 0 {
            return Err(invalid_option("poll max attempts must be positive"));
        }
        Ok(())
    }
}

fn invalid_option(msg: &str) -> Error {
    Error::Other {
        message: format!("invalid options: {}", msg),
        retryable: false,
    }
}

/// Result of a completed swap.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Outcome {
    pub instance_name: String,
    pub previous_instance_id: String,
    pub image_id: String,
    pub image_name: String,
    pub replacement_instance_id: String,
    pub target_group_arn: String,
    pub instance_type: String,
}

/// State derived over the run. Each field is set once by its step and must be
/// set before any later step reads it.
#[derive(Debug, Clone, Default)]
pub struct Session {
    previous_instance: Option<Instance>,
    target_group_arn: Option<String>,
    image_id: Option<String>,
    image_name: Option<String>,
    new_instance_id: Option<String>,
    instance_type: Option<String>,
}

impl Session {
    pub fn previous_instance(&self) -> Result<&Instance> {
        self.previous_instance
            .as_ref()
            .ok_or_else(|| not_set("previous instance", "discover the instance"))
    }

    pub fn previous_instance_id(&self) -> Result<String> {
        let instance = self.previous_instance()?;
        match instance.instance_id() {
            Some(v) => Ok(v.to_string()),
            None => Err(Error::API {
                message: String::from("previous instance has no instance Id"),
                retryable: false,
            }),
        }
    }

    pub fn target_group_arn(&self) -> Result<&str> {
        self.target_group_arn
            .as_deref()
            .ok_or_else(|| not_set("target group ARN", "find the target group"))
    }

    pub fn image_id(&self) -> Result<&str> {
        self.image_id
            .as_deref()
            .ok_or_else(|| not_set("image Id", "create the image"))
    }

    pub fn image_name(&self) -> Result<&str> {
        self.image_name
            .as_deref()
            .ok_or_else(|| not_set("image name", "create the image"))
    }

    pub fn new_instance_id(&self) -> Result<&str> {
        self.new_instance_id
            .as_deref()
            .ok_or_else(|| not_set("new instance Id", "launch the replacement"))
    }

    pub fn instance_type(&self) -> Result<&str> {
        self.instance_type
            .as_deref()
            .ok_or_else(|| not_set("instance type", "resize the instance"))
    }

    pub fn set_previous_instance(&mut self, instance: Instance) {
        self.previous_instance = Some(instance);
    }

    pub fn set_target_group_arn(&mut self, arn: &str) {
        self.target_group_arn = Some(String::from(arn));
    }

    pub fn set_image(&mut self, image_id: &str, image_name: &str) {
        self.image_id = Some(String::from(image_id));
        self.image_name = Some(String::from(image_name));
    }

    pub fn set_new_instance_id(&mut self, instance_id: &str) {
        self.new_instance_id = Some(String::from(instance_id));
    }

    pub fn set_instance_type(&mut self, instance_type: &str) {
        self.instance_type = Some(String::from(instance_type));
    }

    pub fn outcome(&self, instance_name: &str) -> Result<Outcome> {
        Ok(Outcome {
            instance_name: String::from(instance_name),
            previous_instance_id: self.previous_instance_id()?,
            image_id: self.image_id()?.to_string(),
            image_name: self.image_name()?.to_string(),
            replacement_instance_id: self.new_instance_id()?.to_string(),
            target_group_arn: self.target_group_arn()?.to_string(),
            instance_type: self.instance_type()?.to_string(),
        })
    }
}

fn not_set(what: &str, step: &str) -> Error {
    Error::Other {
        message: format!("{} not set; {} first", what, step),
        retryable: false,
    }
}

/// Sequences the swap over the EC2 and ELBv2 managers.
pub struct Swapper<P: InstanceTypePrompt> {
    pub opts: Options,
    pub ec2_manager: ec2::Manager,
    pub elbv2_manager: elbv2::Manager,
    pub session: Session,
    prompt: P,
    poll_cfg: poll::Config,
}

impl<P: InstanceTypePrompt> Swapper<P> {
    pub fn new(shared_config: &AwsSdkConfig, opts: Options, prompt: P) -> Self {
        let poll_cfg = opts.poll_config();
        Self {
            opts,
            ec2_manager: ec2::Manager::new(shared_config),
            elbv2_manager: elbv2::Manager::new(shared_config),
            session: Session::default(),
            prompt,
            poll_cfg,
        }
    }

    /// Runs every step in order.
    pub async fn run(&mut self) -> Result<Outcome> {
        self.opts.validate()?;
        log::info!(
            "swapping instance '{}' to '{}' (replacement '{}')",
            self.opts.instance_name,
            self.opts.target_instance_type,
            self.opts.replacement_instance_type
        );

        self.discover().await.map_err(|e| failed_at("discover", e))?;
        self.find_target_group()
            .await
            .map_err(|e| failed_at("find_target_group", e))?;
        let available = self
            .create_image()
            .await
            .map_err(|e| failed_at("create_image", e))?;
        if !available {
            let e = Error::Other {
                message: format!("image '{}' is not available", self.session.image_id()?),
                retryable: false,
            };
            return Err(failed_at("create_image", e));
        }
        self.launch_replacement()
            .await
            .map_err(|e| failed_at("launch_replacement", e))?;
        self.cut_over()
            .await
            .map_err(|e| failed_at("cut_over", e))?;
        self.resize_and_swap_back()
            .await
            .map_err(|e| failed_at("resize_and_swap_back", e))?;

        let outcome = self.session.outcome(&self.opts.instance_name)?;
        log::info!("swapped instance '{}'", self.opts.instance_name);
        Ok(outcome)
    }

    /// Finds the only running instance with the name.
    pub async fn discover(&mut self) -> Result<()> {
        let instance = self
            .ec2_manager
            .describe_running_instance_by_name(&self.opts.instance_name)
            .await?;
        self.session.set_previous_instance(instance);
        Ok(())
    }

    /// Finds the only target group where the previous instance is healthy.
    pub async fn find_target_group(&mut self) -> Result<()> {
        let previous_id = self.session.previous_instance_id()?;
        let arn = self
            .elbv2_manager
            .find_target_group_with_healthy_target(&previous_id)
            .await?;
        log::info!("instance '{}' serves target group '{}'", previous_id, arn);
        self.session.set_target_group_arn(&arn);
        Ok(())
    }

    /// Creates an AMI from the previous instance and waits until it is available.
    /// Returns false if the image is not available after the wait.
    pub async fn create_image(&mut self) -> Result<bool> {
        let instance = self.session.previous_instance()?;
        let previous_id = self.session.previous_instance_id()?;
        let name = match ec2::name_tag(instance) {
            Some(v) => v,
            None => {
                return Err(Error::Other {
                    message: format!("instance '{}' has no Name tag", previous_id),
                    retryable: false,
                });
            }
        };

        let image_name = time::image_name_now(&name);
        let description = self
            .opts
            .image_description
            .clone()
            .unwrap_or_else(|| format!("ec2-swap image of {}", previous_id));
        let image_id = self
            .ec2_manager
            .create_image(
                &previous_id,
                &image_name,
                &description,
                self.opts.image_no_reboot,
            )
            .await?;
        self.session.set_image(&image_id, &image_name);

        self.ec2_manager
            .poll_image_available(&image_id, &self.poll_cfg)
            .await?;

        let state = self.ec2_manager.describe_image_state(&image_id).await?;
        Ok(matches!(
            state,
            Some(aws_sdk_ec2::types::ImageState::Available)
        ))
    }

    /// Launches the replacement from the image and waits until it is running.
    pub async fn launch_replacement(&mut self) -> Result<()> {
        let image_id = self.session.image_id()?.to_string();
        let instance = self.session.previous_instance()?;
        let previous_id = self.session.previous_instance_id()?;

        let volume_id = match ec2::root_volume_id(instance, &self.opts.device_name) {
            Some(v) => v,
            None => {
                return Err(Error::Other {
                    message: format!("instance '{}' has no EBS volume", previous_id),
                    retryable: false,
                });
            }
        };
        let volume = self.ec2_manager.describe_volume(&volume_id).await?;
        let launch = ec2::Launch::from_instance(
            instance,
            &volume,
            &image_id,
            &self.opts.replacement_instance_type,
            &self.opts.device_name,
            &self.opts.instance_name,
        )?;
        log::info!(
            "launching replacement in subnet {:?} with security groups {:?}",
            launch.subnet_id,
            launch.security_group_ids
        );
        let new_instance_id = self.ec2_manager.run_instance(&launch).await?;
        self.session.set_new_instance_id(&new_instance_id);

        self.ec2_manager
            .poll_instance_state(&new_instance_id, InstanceStateName::Running, &self.poll_cfg)
            .await
    }

    /// Moves the traffic from the previous instance to the replacement.
    pub async fn cut_over(&mut self) -> Result<()> {
        let arn = self.session.target_group_arn()?.to_string();
        let previous_id = self.session.previous_instance_id()?;
        let new_instance_id = self.session.new_instance_id()?.to_string();

        self.move_traffic(&arn, &previous_id, &new_instance_id)
            .await
    }

    /// Stops and resizes the previous instance, moves the traffic back to it,
    /// then stops the replacement.
    pub async fn resize_and_swap_back(&mut self) -> Result<()> {
        let arn = self.session.target_group_arn()?.to_string();
        let previous_id = self.session.previous_instance_id()?;
        let new_instance_id = self.session.new_instance_id()?.to_string();

        self.ec2_manager.stop_instance(&previous_id).await?;
        self.ec2_manager
            .poll_instance_state(&previous_id, InstanceStateName::Stopped, &self.poll_cfg)
            .await?;

        let ec2_manager = &self.ec2_manager;
        let pid: &str = &previous_id;
        let applied = retry_with_prompt(
            &self.opts.target_instance_type,
            &mut self.prompt,
            move |instance_type: String| async move {
                ec2_manager.modify_instance_type(pid, &instance_type).await?;
                ec2_manager.start_instance(pid).await
            },
        )
        .await?;
        log::info!("instance '{}' now runs as '{}'", previous_id, applied);
        self.session.set_instance_type(&applied);

        self.ec2_manager
            .poll_instance_state(&previous_id, InstanceStateName::Running, &self.poll_cfg)
            .await?;

        self.move_traffic(&arn, &new_instance_id, &previous_id)
            .await?;

        self.ec2_manager.stop_instance(&new_instance_id).await?;
        self.ec2_manager
            .poll_instance_state(&new_instance_id, InstanceStateName::Stopped, &self.poll_cfg)
            .await
    }

    /// Registers "to" and waits until healthy, then deregisters "from" and
    /// waits until it is drained.
    async fn move_traffic(&self, arn: &str, from: &str, to: &str) -> Result<()> {
        log::info!("moving traffic in '{}' from '{}' to '{}'", arn, from, to);
        let port = self.opts.port;

        self.elbv2_manager.register_target(arn, to, port).await?;
        self.elbv2_manager
            .poll_target_in_service(arn, to, &self.poll_cfg)
            .await?;

        self.elbv2_manager.deregister_target(arn, from, port).await?;
        self.elbv2_manager
            .poll_target_deregistered(arn, from, &self.poll_cfg)
            .await
    }
}

/// Logs the failed step and prefixes it to the error message,
/// keeping the error kind and retryability.
pub fn failed_at(step: &str, e: Error) -> Error {
    log::error!("step '{}' failed ({})", step, e.message());
    match e {
        Error::API { message, retryable } => Error::API {
            message: format!("step '{}' failed: {}", step, message),
            retryable,
        },
        Error::Other { message, retryable } => Error::Other {
            message: format!("step '{}' failed: {}", step, message),
            retryable,
        },
    }
}

/// Calls "attempt" with the instance type until it succeeds, asking the
/// prompt for another instance type after each failure.
/// Returns the instance type that succeeded. Fails only if the prompt fails.
pub async fn retry_with_prompt<P, F, Fut>(
    initial: &str,
    prompt: &mut P,
    mut attempt: F,
) -> Result<String>
where
    P: InstanceTypePrompt + ?Sized,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut instance_type = String::from(initial);
    loop {
        match attempt(instance_type.clone()).await {
            Ok(()) => return Ok(instance_type),
            Err(e) => {
                log::warn!(
                    "failed to apply instance type '{}' ({})",
                    instance_type,
                    e.message()
                );
                instance_type = prompt.next_instance_type(&instance_type, &e)?;
            }
        }
    }
}

/// Runs the whole swap with the default options and the interactive prompt.
pub async fn procedure(
    shared_config: &AwsSdkConfig,
    instance_name: &str,
    target_instance_type: &str,
) -> Result<Outcome> {
    let opts = Options::new(instance_name, target_instance_type);
    let mut swapper = Swapper::new(shared_config, opts, Interactive::default());
    swapper.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        answers: VecDeque<String>,
        asked: Vec<String>,
    }

    impl InstanceTypePrompt for Scripted {
        fn next_instance_type(&mut self, failed: &str, _err: &Error) -> Result<String> {
            self.asked.push(String::from(failed));
            self.answers.pop_front().ok_or_else(|| Error::Other {
                message: String::from("no more answers"),
                retryable: false,
            })
        }
    }

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    /// RUST_LOG=debug cargo test --package ec2-swap --lib -- swap::tests::test_session_not_set --exact --show-output
    #[test]
    fn test_session_not_set() {
        let _ = env_logger::builder().is_test(true).try_init();

        let session = Session::default();
        let e = session.image_id().unwrap_err();
        assert!(e.message().contains("image Id not set"));
        assert!(!e.retryable());
        assert!(session.new_instance_id().is_err());
        assert!(session.previous_instance().is_err());
        assert!(session.previous_instance_id().is_err());
        assert!(session.target_group_arn().is_err());
        assert!(session.outcome("web").is_err());
    }

    #[test]
    fn test_session_outcome() {
        let mut session = Session::default();
        session.set_previous_instance(Instance::builder().instance_id("i-old").build());
        session.set_target_group_arn("arn:tg/web");
        session.set_image("ami-1", "web_202301020304");
        assert!(session.outcome("web").is_err());

        session.set_new_instance_id("i-new");
        session.set_instance_type("m5.large");
        let outcome = session.outcome("web").unwrap();
        assert_eq!(
            outcome,
            Outcome {
                instance_name: String::from("web"),
                previous_instance_id: String::from("i-old"),
                image_id: String::from("ami-1"),
                image_name: String::from("web_202301020304"),
                replacement_instance_id: String::from("i-new"),
                target_group_arn: String::from("arn:tg/web"),
                instance_type: String::from("m5.large"),
            }
        );

        let s = serde_yaml::to_string(&outcome).unwrap();
        assert!(s.contains("replacement_instance_id: i-new"));
    }

    #[test]
    fn test_failed_at() {
        let _ = env_logger::builder().is_test(true).try_init();

        let e = failed_at(
            "cut_over",
            Error::Other {
                message: String::from("failed to poll 'target 'i-new' in service' in time"),
                retryable: true,
            },
        );
        assert!(matches!(e, Error::Other { .. }));
        assert!(e.retryable());
        assert!(e.message().starts_with("step 'cut_over' failed: "));
        assert!(e.message().contains("i-new"));

        let e = failed_at(
            "discover",
            Error::API {
                message: String::from("failed describe_instances"),
                retryable: false,
            },
        );
        assert!(matches!(e, Error::API { .. }));
        assert!(!e.retryable());
        assert_eq!(
            e.message(),
            "step 'discover' failed: failed describe_instances"
        );
    }

    #[test]
    fn test_options() {
        let opts = Options::new("web", "m5.large");
        assert!(opts.validate().is_ok());
        assert_eq!(opts.replacement_instance_type, "t2.micro");
        assert_eq!(opts.port, 80);
        assert_eq!(opts.device_name, "/dev/sda1");
        assert_eq!(opts.poll_config(), poll::Config::default());

        assert!(Options::new("", "m5.large").validate().is_err());
        assert!(Options::new("web", "").validate().is_err());

        let mut bad = Options::new("web", "m5.large");
        bad.port = 0;
        assert!(bad.validate().is_err());

        let s = serde_yaml::to_string(&opts).unwrap();
        let parsed: Options = serde_yaml::from_str(&s).unwrap();
        assert_eq!(opts, parsed);
    }

    #[test]
    fn test_retry_with_prompt() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut prompt = Scripted {
            answers: VecDeque::from(vec![String::from("m5.xlarge"), String::from("m5.large")]),
            asked: Vec::new(),
        };
        let mut tried: Vec<String> = Vec::new();
        let ret = ab!(retry_with_prompt("bogus", &mut prompt, |ty: String| {
            tried.push(ty.clone());
            async move {
                if ty == "m5.large" {
                    Ok(())
                } else {
                    Err(Error::API {
                        message: format!("unsupported instance type {}", ty),
                        retryable: false,
                    })
                }
            }
        }));
        assert_eq!(ret.unwrap(), "m5.large");
        assert_eq!(tried, vec!["bogus", "m5.xlarge", "m5.large"]);
        assert_eq!(prompt.asked, vec!["bogus", "m5.xlarge"]);

        let mut prompt = Scripted {
            answers: VecDeque::new(),
            asked: Vec::new(),
        };
        let ret = ab!(retry_with_prompt("t2.micro", &mut prompt, |_ty: String| async {
            Ok(())
        }));
        assert_eq!(ret.unwrap(), "t2.micro");
        assert!(prompt.asked.is_empty());

        let ret = ab!(retry_with_prompt("bogus", &mut NoPrompt, |_ty: String| async {
            Err(Error::API {
                message: String::from("InvalidInstanceType"),
                retryable: false,
            })
        }));
        let e = ret.unwrap_err();
        assert!(e.message().contains("bogus"));
    }
}
