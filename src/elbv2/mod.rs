use crate::{
    errors::{self, Error, Result},
    poll,
};
use aws_sdk_elasticloadbalancingv2::{
    operation::describe_target_health::DescribeTargetHealthError,
    types::{TargetDescription, TargetHealthDescription, TargetHealthStateEnum},
    Client,
};
use aws_smithy_client::SdkError;
use aws_types::SdkConfig as AwsSdkConfig;

/// Default port for registered targets.
pub const DEFAULT_PORT: i32 = 80;

/// Implements AWS Elastic Load Balancing v2 manager.
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

    /// Lists the ARNs of all target groups in the region.
    pub async fn list_target_group_arns(&self) -> Result<Vec<String>> {
        log::info!("listing target groups in region '{}'", self.region);

        let mut arns: Vec<String> = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let resp = self
                .cli
                .describe_target_groups()
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(|e| Error::API {
                    message: format!("failed describe_target_groups {:?}", e),
                    retryable: errors::is_sdk_err_retryable(&e),
                })?;

            for tg in resp.target_groups().unwrap_or_default() {
                if let Some(arn) = tg.target_group_arn() {
                    arns.push(arn.to_string());
                }
            }

            marker = resp.next_marker().map(String::from);
            if marker.is_none() {
                break;
            }
        }

        log::info!("listed {} target groups", arns.len());
        Ok(arns)
    }

    /// Describes the health of the targets in the group.
    /// If "target_id" is not none, only describes that target.
    /// Returns "None" if the target is not visible yet.
    pub async fn describe_target_health(
        &self,
        target_group_arn: &str,
        target_id: Option<&str>,
    ) -> Result<Option<Vec<TargetHealthDescription>>> {
        let mut req = self
            .cli
            .describe_target_health()
            .target_group_arn(target_group_arn);
        if let Some(id) = target_id {
            req = req.targets(TargetDescription::builder().id(id).build());
        }

        let resp = match req.send().await {
            Ok(v) => v,
            Err(e) => {
                if is_err_target_not_found(&e) {
                    log::warn!(
                        "target {:?} not found in '{}' ({})",
                        target_id,
                        target_group_arn,
                        explain_err_describe_target_health(&e)
                    );
                    return Ok(None);
                }
                return Err(Error::API {
                    message: format!("failed describe_target_health {:?}", e),
                    retryable: errors::is_sdk_err_retryable(&e),
                });
            }
        };

        Ok(Some(Vec::from(
            resp.target_health_descriptions().unwrap_or_default(),
        )))
    }

    /// Returns the ARNs of all target groups where the target is registered and healthy.
    pub async fn find_target_groups_with_healthy_target(
        &self,
        target_id: &str,
    ) -> Result<Vec<String>> {
        log::info!("finding target groups with healthy target '{}'", target_id);

        let mut matched: Vec<String> = Vec::new();
        for arn in self.list_target_group_arns().await? {
            let descs = self
                .describe_target_health(&arn, None)
                .await?
                .unwrap_or_default();
            if is_healthy(&descs, target_id) {
                log::info!("target '{}' is healthy in '{}'", target_id, arn);
                matched.push(arn);
            }
        }
        Ok(matched)
    }

    /// Returns the only target group where the target is registered and healthy.
    pub async fn find_target_group_with_healthy_target(&self, target_id: &str) -> Result<String> {
        let arns = self.find_target_groups_with_healthy_target(target_id).await?;
        select_single_target_group(target_id, arns)
    }

    /// Registers the target in the group.
    pub async fn register_target(
        &self,
        target_group_arn: &str,
        target_id: &str,
        port: i32,
    ) -> Result<()> {
        log::info!(
            "registering target '{}:{}' in '{}'",
            target_id,
            port,
            target_group_arn
        );
        self.cli
            .register_targets()
            .target_group_arn(target_group_arn)
            .targets(TargetDescription::builder().id(target_id).port(port).build())
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed register_targets {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;
        Ok(())
    }

    /// Deregisters the target from the group.
    pub async fn deregister_target(
        &self,
        target_group_arn: &str,
        target_id: &str,
        port: i32,
    ) -> Result<()> {
        log::info!(
            "deregistering target '{}:{}' from '{}'",
            target_id,
            port,
            target_group_arn
        );
        self.cli
            .deregister_targets()
            .target_group_arn(target_group_arn)
            .targets(TargetDescription::builder().id(target_id).port(port).build())
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed deregister_targets {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;
        Ok(())
    }

    /// Polls until the target is healthy in the group.
    pub async fn poll_target_in_service(
        &self,
        target_group_arn: &str,
        target_id: &str,
        cfg: &poll::Config,
    ) -> Result<()> {
        let desc = format!("target '{}' in service", target_id);
        poll::until(&desc, cfg, move || async move {
            let descs = self
                .describe_target_health(target_group_arn, Some(target_id))
                .await?;
            log::info!(
                "target '{}' is {:?}",
                target_id,
                descs.as_deref().and_then(|d| target_state(d, target_id))
            );
            if is_in_service(descs.as_deref(), target_id) {
                Ok(Some(()))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Polls until the target is no longer registered in the group.
    pub async fn poll_target_deregistered(
        &self,
        target_group_arn: &str,
        target_id: &str,
        cfg: &poll::Config,
    ) -> Result<()> {
        let desc = format!("target '{}' deregistered", target_id);
        poll::until(&desc, cfg, move || async move {
            let descs = self
                .describe_target_health(target_group_arn, Some(target_id))
                .await?;
            log::info!(
                "target '{}' is {:?}",
                target_id,
                descs.as_deref().and_then(|d| target_state(d, target_id))
            );
            if is_gone(descs.as_deref(), target_id) {
                Ok(Some(()))
            } else {
                Ok(None)
            }
        })
        .await
    }
}

/// Returns the health state of the target, if it is described.
pub fn target_state(
    descs: &[TargetHealthDescription],
    target_id: &str,
) -> Option<TargetHealthStateEnum> {
    descs
        .iter()
        .find(|d| d.target().and_then(|t| t.id()) == Some(target_id))
        .and_then(|d| d.target_health())
        .and_then(|h| h.state())
        .cloned()
}

/// Returns true if the target is described as healthy.
pub fn is_healthy(descs: &[TargetHealthDescription], target_id: &str) -> bool {
    matches!(
        target_state(descs, target_id),
        Some(TargetHealthStateEnum::Healthy)
    )
}

/// Returns true if the target state means it is no longer registered.
pub fn is_deregistered(state: Option<&TargetHealthStateEnum>) -> bool {
    match state {
        None | Some(TargetHealthStateEnum::Unused) => true,
        Some(_) => false,
    }
}

/// Decides the in-service wait over a "describe_target_health" result.
/// "None" (target not visible yet) keeps polling.
pub fn is_in_service(descs: Option<&[TargetHealthDescription]>, target_id: &str) -> bool {
    match descs {
        Some(d) => is_healthy(d, target_id),
        None => false,
    }
}

/// Decides the deregistration wait over a "describe_target_health" result.
/// "None" (invalid target) means it is gone from the group.
pub fn is_gone(descs: Option<&[TargetHealthDescription]>, target_id: &str) -> bool {
    match descs {
        Some(d) => is_deregistered(target_state(d, target_id).as_ref()),
        None => true,
    }
}

/// "InvalidTarget" is returned for targets not in the group, and
/// "InvalidInstance" while a newly launched instance is not yet
/// visible to the load balancer.
pub fn is_target_not_found_code(code: Option<&str>) -> bool {
    matches!(code, Some("InvalidTarget") | Some("InvalidInstance"))
}

/// Returns the only ARN or fails with the number of matches.
pub fn select_single_target_group(target_id: &str, arns: Vec<String>) -> Result<String> {
    if arns.len() != 1 {
        return Err(Error::Other {
            message: format!(
                "instance '{}' is healthy in {} target groups (expected 1)",
                target_id,
                arns.len()
            ),
            retryable: false,
        });
    }
    Ok(arns[0].clone())
}

#[inline]
fn is_err_target_not_found(e: &SdkError<DescribeTargetHealthError>) -> bool {
    match e {
        SdkError::ServiceError(err) => {
            err.err().is_invalid_target_exception()
                || is_target_not_found_code(err.err().meta().code())
        }
        _ => false,
    }
}

#[inline]
fn explain_err_describe_target_health(e: &SdkError<DescribeTargetHealthError>) -> String {
    match e {
        SdkError::ServiceError(err) => format!(
            "describe_target_health [code '{:?}', message '{:?}']",
            err.err().meta().code(),
            err.err().meta().message(),
        ),
        _ => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_elasticloadbalancingv2::types::TargetHealth;

    fn desc(id: &str, state: TargetHealthStateEnum) -> TargetHealthDescription {
        TargetHealthDescription::builder()
            .target(TargetDescription::builder().id(id).port(DEFAULT_PORT).build())
            .target_health(TargetHealth::builder().state(state).build())
            .build()
    }

    /// RUST_LOG=debug cargo test --package ec2-swap --lib -- elbv2::tests::test_is_healthy --exact --show-output
    #[test]
    fn test_is_healthy() {
        let _ = env_logger::builder().is_test(true).try_init();

        let descs = vec![
            desc("i-old", TargetHealthStateEnum::Healthy),
            desc("i-new", TargetHealthStateEnum::Initial),
            desc("i-gone", TargetHealthStateEnum::Draining),
        ];
        assert!(is_healthy(&descs, "i-old"));
        assert!(!is_healthy(&descs, "i-new"));
        assert!(!is_healthy(&descs, "i-gone"));
        assert!(!is_healthy(&descs, "i-missing"));
        assert!(!is_healthy(&[], "i-old"));

        assert_eq!(
            target_state(&descs, "i-new"),
            Some(TargetHealthStateEnum::Initial)
        );
        assert_eq!(target_state(&descs, "i-missing"), None);
    }

    #[test]
    fn test_is_deregistered() {
        assert!(is_deregistered(None));
        assert!(is_deregistered(Some(&TargetHealthStateEnum::Unused)));
        assert!(!is_deregistered(Some(&TargetHealthStateEnum::Draining)));
        assert!(!is_deregistered(Some(&TargetHealthStateEnum::Healthy)));
    }

    #[test]
    fn test_target_not_found_code() {
        assert!(is_target_not_found_code(Some("InvalidTarget")));
        assert!(is_target_not_found_code(Some("InvalidInstance")));
        assert!(!is_target_not_found_code(Some("TargetGroupNotFound")));
        assert!(!is_target_not_found_code(Some("HealthUnavailable")));
        assert!(!is_target_not_found_code(None));
    }

    /// RUST_LOG=debug cargo test --package ec2-swap --lib -- elbv2::tests::test_wait_decisions --exact --show-output
    #[test]
    fn test_wait_decisions() {
        let _ = env_logger::builder().is_test(true).try_init();

        // not visible yet: keep waiting for in-service, done for deregistration
        assert!(!is_in_service(None, "i-new"));
        assert!(is_gone(None, "i-old"));

        let healthy = vec![desc("i-new", TargetHealthStateEnum::Healthy)];
        assert!(is_in_service(Some(&healthy[..]), "i-new"));
        assert!(!is_gone(Some(&healthy[..]), "i-new"));

        let initial = vec![desc("i-new", TargetHealthStateEnum::Initial)];
        assert!(!is_in_service(Some(&initial[..]), "i-new"));

        let draining = vec![desc("i-old", TargetHealthStateEnum::Draining)];
        assert!(!is_gone(Some(&draining[..]), "i-old"));

        let unused = vec![desc("i-old", TargetHealthStateEnum::Unused)];
        assert!(is_gone(Some(&unused[..]), "i-old"));
        assert!(is_gone(Some(&[][..]), "i-old"));
    }

    #[test]
    fn test_select_single_target_group() {
        let arn = select_single_target_group("i-1", vec![String::from("arn:tg/web")]).unwrap();
        assert_eq!(arn, "arn:tg/web");

        let e = select_single_target_group("i-1", vec![]).unwrap_err();
        assert!(e.message().contains("0 target groups"));
        assert!(!e.retryable());

        let e = select_single_target_group(
            "i-1",
            vec![String::from("arn:tg/a"), String::from("arn:tg/b")],
        )
        .unwrap_err();
        assert!(e.message().contains("2 target groups"));
    }
}
