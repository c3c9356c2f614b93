//! Device identification by advertised remote name

use crate::domain::models::DeviceType;
use crate::domain::settings::Settings;
use tracing::info;

/// True if `name` equals one entry of `collection`
///
/// Trailing NULs and whitespace are ignored on both sides; radios report
/// names padded to the maximum name length.
pub fn name_is_in_collection(name: &str, collection: &[String]) -> bool {
    let name = trim_name(name);
    !name.is_empty() && collection.iter().any(|entry| trim_name(entry) == name)
}

fn trim_name(name: &str) -> &str {
    name.trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
}

/// Classify a remote name against the configured allow-lists
///
/// Every enabled list is checked in order (SIXAXIS, NAVIGATION, MOTION,
/// WIRELESS) and a later match replaces an earlier one.
pub fn classify(name: &str, settings: &Settings) -> DeviceType {
    let checks = [
        (
            settings.is_sixaxis_supported,
            &settings.sixaxis_supported_names,
            DeviceType::Sixaxis,
        ),
        (
            settings.is_navigation_supported,
            &settings.navigation_supported_names,
            DeviceType::Navigation,
        ),
        (
            settings.is_motion_supported,
            &settings.motion_supported_names,
            DeviceType::Motion,
        ),
        (
            settings.is_wireless_supported,
            &settings.wireless_supported_names,
            DeviceType::Wireless,
        ),
    ];

    let mut device_type = DeviceType::Unknown;
    for (enabled, names, candidate) in checks {
        if enabled && name_is_in_collection(name, names) {
            info!("Remote name {:?} identified as {} compatible", name, candidate);
            device_type = candidate;
        }
    }
    device_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let settings = Settings::default();
        assert_eq!(
            classify("PLAYSTATION(R)3 Controller", &settings),
            DeviceType::Sixaxis
        );
        assert_eq!(
            classify("Navigation Controller", &settings),
            DeviceType::Navigation
        );
        assert_eq!(classify("Motion Controller", &settings), DeviceType::Motion);
        assert_eq!(
            classify("Wireless Controller", &settings),
            DeviceType::Wireless
        );
        assert_eq!(classify("Xbox Controller", &settings), DeviceType::Unknown);
    }

    #[test]
    fn test_padded_name_matches() {
        let names = vec!["Motion Controller".to_string()];
        assert!(name_is_in_collection("Motion Controller\0\0\0", &names));
        assert!(!name_is_in_collection("motion controller", &names));
        assert!(!name_is_in_collection("", &names));
    }

    #[test]
    fn test_disabled_list_is_skipped() {
        let settings = Settings {
            is_motion_supported: false,
            ..Default::default()
        };
        assert_eq!(classify("Motion Controller", &settings), DeviceType::Unknown);
    }

    #[test]
    fn test_last_match_wins() {
        let settings = Settings {
            sixaxis_supported_names: vec!["Shared Name".to_string()],
            wireless_supported_names: vec!["Shared Name".to_string()],
            ..Default::default()
        };
        assert_eq!(classify("Shared Name", &settings), DeviceType::Wireless);
    }
}
