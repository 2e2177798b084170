use chrono::prelude::*;

/// Format of the timestamp suffix in image names (minute precision).
pub const IMAGE_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";

/// Generates an image name from the instance "Name" tag value
/// followed by the local timestamp.
///
/// e.g., "web_202310181530"
pub fn image_name(name: &str, now: &DateTime<Local>) -> String {
    format!("{}_{}", name, now.format(IMAGE_TIMESTAMP_FORMAT))
}

/// Same as "image_name" but with the current local time.
pub fn image_name_now(name: &str) -> String {
    image_name(name, &Local::now())
}

/// RUST_LOG=debug cargo test --package ec2-swap --lib -- utils::time::test_image_name --exact --show-output
#[test]
fn test_image_name() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .is_test(true)
        .try_init();

    let now = Local.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
    assert_eq!(image_name("web", &now), "web_202301020304");

    let s = image_name_now("api-server");
    log::info!("image name: {}", s);
    assert!(s.starts_with("api-server_"));
    assert_eq!(s.len(), "api-server_".len() + 12);
}
