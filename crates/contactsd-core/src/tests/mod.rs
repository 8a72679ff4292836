pub mod backend_tests;
pub mod identity_tests;
pub mod roster_tests;

use crate::config::CoreConfig;
use crate::connection::{Feature, FeatureBatch, CONTACT_FEATURES};
use crate::event::{ContactEvent, EventReceiver};
use contactsd_api::{AccountSummary, Capability, PresenceType};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tokio::time::{timeout, Duration};

pub fn base_config(dir: &Path) -> CoreConfig {
    CoreConfig {
        cache_dir: dir.join("cache"),
        avatar_dir: dir.join("avatars"),
        event_capacity: 64,
        ..CoreConfig::default()
    }
}

pub fn summary(account_path: &str, presence: PresenceType, enabled: bool) -> AccountSummary {
    AccountSummary {
        account_path: account_path.to_string(),
        account_uri: format!("im://{}", account_path),
        service_provider: "jabber".to_string(),
        service_provider_display_name: "Jabber".to_string(),
        account_display_name: account_path.to_string(),
        account_icon_path: String::new(),
        presence_state: presence,
        presence_message: String::new(),
        enabled,
    }
}

pub fn full_batch(handle: u32, alias: &str, avatar_token: Option<&str>) -> FeatureBatch {
    FeatureBatch {
        handle,
        actual_features: CONTACT_FEATURES.to_vec(),
        alias: alias.to_string(),
        presence: PresenceType::Available,
        presence_status: "available".to_string(),
        presence_message: "hi".to_string(),
        capabilities: [Capability::TextChat].into_iter().collect(),
        avatar_token: avatar_token.map(str::to_string),
    }
}

pub fn batch_without_avatars(handle: u32, alias: &str) -> FeatureBatch {
    FeatureBatch {
        actual_features: vec![Feature::Alias, Feature::SimplePresence, Feature::Capabilities],
        ..full_batch(handle, alias, None)
    }
}

pub fn jpeg_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(4, 4, Rgb([200, 40, 40]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .expect("encode jpeg");
    out.into_inner()
}

pub async fn next_event(rx: &mut EventReceiver) -> ContactEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event timeout")
        .expect("event bus")
}

/// Asserts nothing else arrives within a short window.
pub async fn assert_quiet(rx: &mut EventReceiver) {
    if let Ok(Ok(event)) = timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected event {:?}", event);
    }
}
