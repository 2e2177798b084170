use crate::errors::{Error, Result};
use dialoguer::{theme::ColorfulTheme, Input};

/// Supplies another instance type after a failed resize.
pub trait InstanceTypePrompt {
    /// Returns the next instance type to try, or an error to abort.
    fn next_instance_type(&mut self, failed: &str, err: &Error) -> Result<String>;
}

/// Asks the operator on the terminal until a non-empty value is entered.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interactive;

impl InstanceTypePrompt for Interactive {
    fn next_instance_type(&mut self, failed: &str, err: &Error) -> Result<String> {
        println!(
            "\nfailed to change instance type to '{}':\n{}\n",
            failed,
            err.message()
        );
        let entered: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Instance type")
            .validate_with(|input: &String| validate_instance_type(input))
            .interact_text()
            .map_err(|e| Error::Other {
                message: format!("failed to read instance type {}", e),
                retryable: false,
            })?;
        Ok(entered.trim().to_string())
    }
}

/// Rejects blank input so an empty type never reaches "modify_instance_attribute".
pub fn validate_instance_type(input: &str) -> std::result::Result<(), String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(String::from("instance type must not be empty"));
    }
    if trimmed.contains(char::is_whitespace) {
        return Err(format!("instance type '{}' must not contain spaces", trimmed));
    }
    Ok(())
}

/// Never retries; fails with the rejected instance type.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl InstanceTypePrompt for NoPrompt {
    fn next_instance_type(&mut self, failed: &str, err: &Error) -> Result<String> {
        Err(Error::Other {
            message: format!(
                "failed to change instance type to '{}' ({})",
                failed,
                err.message()
            ),
            retryable: false,
        })
    }
}

#[test]
fn test_no_prompt() {
    let err = Error::API {
        message: String::from("InvalidInstanceType"),
        retryable: false,
    };
    let e = NoPrompt.next_instance_type("x9.huge", &err).unwrap_err();
    assert!(e.message().contains("x9.huge"));
    assert!(e.message().contains("InvalidInstanceType"));
    assert!(!e.retryable());
}

#[test]
fn test_validate_instance_type() {
    assert!(validate_instance_type("m5.large").is_ok());
    assert!(validate_instance_type("  m5.large \n").is_ok());
    assert!(validate_instance_type("").is_err());
    assert!(validate_instance_type("   ").is_err());
    assert!(validate_instance_type("\t\n").is_err());
    assert!(validate_instance_type("m5 large").is_err());
}
