use std::io::{self, stdout};

use clap::{crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use dialoguer::{theme::ColorfulTheme, Select};
use ec2_swap::swap::{self, InstanceTypePrompt, Interactive, NoPrompt, Options, Swapper};

const APP_NAME: &str = "ec2-swap";

pub fn command() -> Command {
    Command::new(APP_NAME)
        .version(crate_version!())
        .about("Replaces an EC2 instance behind its target group, resizes it, and swaps traffic back")
        .arg(
            Arg::new("LOG_LEVEL")
                .long("log-level")
                .short('l')
                .help("Sets the log level")
                .required(false)
                .num_args(1)
                .value_parser(["debug", "info"])
                .default_value("info"),
        )
        .arg(
            Arg::new("REGION")
                .long("region")
                .short('r')
                .help("Sets the AWS region")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("PROFILE_NAME")
                .long("profile-name")
                .help("Sets the AWS credential profile name")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("INSTANCE_NAME")
                .long("instance-name")
                .short('n')
                .help("Sets the 'Name' tag value of the running instance")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("TARGET_INSTANCE_TYPE")
                .long("target-instance-type")
                .short('t')
                .help("Sets the new instance type of the original instance")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("REPLACEMENT_INSTANCE_TYPE")
                .long("replacement-instance-type")
                .help("Sets the instance type of the temporary replacement")
                .required(false)
                .num_args(1)
                .default_value(swap::DEFAULT_REPLACEMENT_INSTANCE_TYPE),
        )
        .arg(
            Arg::new("PORT")
                .long("port")
                .help("Sets the port of the registered targets")
                .required(false)
                .num_args(1)
                .value_parser(value_parser!(i32))
                .default_value("80"),
        )
        .arg(
            Arg::new("DEVICE_NAME")
                .long("device-name")
                .help("Sets the root device name of the replacement")
                .required(false)
                .num_args(1)
                .default_value("/dev/sda1"),
        )
        .arg(
            Arg::new("POLL_INTERVAL_SECONDS")
                .long("poll-interval-seconds")
                .help("Sets the interval between state polls")
                .required(false)
                .num_args(1)
                .value_parser(value_parser!(u64))
                .default_value("15"),
        )
        .arg(
            Arg::new("POLL_MAX_ATTEMPTS")
                .long("poll-max-attempts")
                .help("Sets the number of state polls before giving up")
                .required(false)
                .num_args(1)
                .value_parser(value_parser!(u32))
                .default_value("40"),
        )
        .arg(
            Arg::new("SKIP_PROMPT")
                .long("skip-prompt")
                .short('s')
                .help("Skips the confirmation and fails instead of asking for another instance type")
                .required(false)
                .action(ArgAction::SetTrue),
        )
}

fn parse_options(matches: &ArgMatches) -> Options {
    let mut opts = Options::new(
        matches
            .get_one::<String>("INSTANCE_NAME")
            .map(String::as_str)
            .unwrap_or(""),
        matches
            .get_one::<String>("TARGET_INSTANCE_TYPE")
            .map(String::as_str)
            .unwrap_or(""),
    );
    if let Some(v) = matches.get_one::<String>("REPLACEMENT_INSTANCE_TYPE") {
        opts.replacement_instance_type = v.clone();
    }
    if let Some(v) = matches.get_one::<i32>("PORT") {
        opts.port = *v;
    }
    if let Some(v) = matches.get_one::<String>("DEVICE_NAME") {
        opts.device_name = v.clone();
    }
    if let Some(v) = matches.get_one::<u64>("POLL_INTERVAL_SECONDS") {
        opts.poll_interval_seconds = *v;
    }
    if let Some(v) = matches.get_one::<u32>("POLL_MAX_ATTEMPTS") {
        opts.poll_max_attempts = *v;
    }
    opts
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = command().get_matches();

    let log_level = matches
        .get_one::<String>("LOG_LEVEL")
        .unwrap_or(&String::from("info"))
        .clone();
    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    );

    let opts = parse_options(&matches);
    opts.validate()?;
    let skip_prompt = matches.get_flag("SKIP_PROMPT");

    let shared_config = ec2_swap::load_config(
        matches.get_one::<String>("REGION").cloned(),
        matches.get_one::<String>("PROFILE_NAME").cloned(),
    )
    .await;

    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print(format!(
            "\nswapping instance '{}' in region {:?}\n",
            opts.instance_name,
            shared_config.region()
        )),
        ResetColor
    )?;
    let opts_yaml = serde_yaml::to_string(&opts)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    println!("{}", opts_yaml);

    if skip_prompt {
        run(&shared_config, opts, NoPrompt).await
    } else {
        let options = &[
            "No, I am not ready to swap the instance.",
            "Yes, let's swap the instance!",
        ];
        let selected = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select your 'swap' option")
            .items(&options[..])
            .default(0)
            .interact()?;
        if selected == 0 {
            return Ok(());
        }
        run(&shared_config, opts, Interactive).await
    }
}

async fn run<P: InstanceTypePrompt>(
    shared_config: &aws_types::SdkConfig,
    opts: Options,
    prompt: P,
) -> io::Result<()> {
    let mut swapper = Swapper::new(shared_config, opts, prompt);
    let outcome = match swapper.run().await {
        Ok(v) => v,
        Err(e) => {
            log::error!("swap failed: {}", e.message());
            log::error!(
                "resources are left as of the failed step ({:?})",
                swapper.session
            );
            return Err(e.into());
        }
    };

    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print("\nswapped instance\n"),
        ResetColor
    )?;
    let outcome_yaml = serde_yaml::to_string(&outcome)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    println!("{}", outcome_yaml);

    Ok(())
}
