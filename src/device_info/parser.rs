//! Parses the combined ASCII text returned by the six FC41 device-info reads
//! into structured fields (`spec.md` §4.3, §4.6), grounded on
//! `original_source/modbus_app/device_info/device_cache.py`.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceInfo {
    pub vendor_name: Option<String>,
    pub model: Option<String>,
    pub bar_code: Option<String>,
    pub manufactured: Option<String>,
    pub description: Option<String>,
    pub archives_info_version: Option<String>,
    pub elabel_version: Option<String>,
    pub is_huawei: bool,
}

/// Ordered prefix table: `(prefix, field setter)`. Matched against each line
/// of the combined text, longest/most specific prefix first so
/// `/$ElabelVersion=` is tried before the plain `ElabelVersion=` fallback.
const PREFIXES: &[&str] = &[
    "VendorName=",
    "BoardType=",
    "Model=",
    "BarCode=",
    "Manufactured=",
    "Description=",
    "ArchivesInfoVersion=",
    "/$ElabelVersion=",
    "ElabelVersion=",
];

/// Parses the six index replies (already concatenated into one text blob by
/// the caller) into a `DeviceInfo`.
pub fn parse_device_info_from_combined(combined_text: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();

    for raw_line in combined_text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        for prefix in PREFIXES {
            if let Some(value) = line.strip_prefix(prefix) {
                let value = value.trim().to_string();
                match *prefix {
                    "VendorName=" => info.vendor_name = Some(value),
                    "BoardType=" | "Model=" => info.model = Some(value),
                    "BarCode=" => info.bar_code = Some(value),
                    "Manufactured=" => info.manufactured = Some(normalize_manufacture_date(&value)),
                    "Description=" => info.description = Some(value),
                    "ArchivesInfoVersion=" => info.archives_info_version = Some(value),
                    "/$ElabelVersion=" | "ElabelVersion=" => info.elabel_version = Some(value),
                    _ => {}
                }
                break;
            }
        }
    }

    info.is_huawei = validate_device_manufacturer(&info);
    info
}

/// Normalizes the manufacture date field (`spec.md` §4.6): a bare two-digit
/// year (`"23"` -> `"2023"`), a two-digit-year ISO date
/// (`"23-11-02"` -> `"2023-11-02"`), a four-digit year or already-ISO date
/// left alone, anything else retained unchanged.
fn normalize_manufacture_date(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('-').collect();
    let is_two_digit_numeric = |s: &str| s.len() == 2 && s.chars().all(|c| c.is_ascii_digit());

    if parts.len() == 3 && is_two_digit_numeric(parts[0]) {
        format!("20{}-{}-{}", parts[0], parts[1], parts[2])
    } else if parts.len() == 1 && is_two_digit_numeric(parts[0]) {
        format!("20{}", parts[0])
    } else {
        raw.to_string()
    }
}

/// True if the parsed fields look like a genuine Huawei ESM module rather
/// than noise from a misaddressed or non-Huawei slave.
fn validate_device_manufacturer(info: &DeviceInfo) -> bool {
    let vendor_is_huawei = info
        .vendor_name
        .as_deref()
        .map(|v| v.to_ascii_uppercase().contains("HUAWEI"))
        .unwrap_or(false);
    let model_is_esm = info
        .model
        .as_deref()
        .map(|m| m.to_ascii_uppercase().starts_with("ESM"))
        .unwrap_or(false);
    vendor_is_huawei || model_is_esm
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 3 — FC41 device-info combined text parses into the expected
    /// structured fields.
    #[test]
    fn parses_a_representative_combined_block() {
        let combined = "VendorName=Huawei\nBoardType=ESM-48150B1\nBarCode=210235937310J2000026\nManufactured=23-11-02\nDescription=ESM-48150B1 Li-ion battery\nArchivesInfoVersion=150\nElabelVersion=001\n";
        let info = parse_device_info_from_combined(combined);
        assert_eq!(info.vendor_name.as_deref(), Some("Huawei"));
        assert_eq!(info.model.as_deref(), Some("ESM-48150B1"));
        assert_eq!(info.bar_code.as_deref(), Some("210235937310J2000026"));
        assert_eq!(info.manufactured.as_deref(), Some("2023-11-02"));
        assert!(info.is_huawei);
    }

    #[test]
    fn four_digit_year_passes_through_unchanged() {
        assert_eq!(normalize_manufacture_date("2023-11-02"), "2023-11-02");
    }

    #[test]
    fn bare_two_digit_year_expands_to_four_digits() {
        assert_eq!(normalize_manufacture_date("23"), "2023");
    }

    #[test]
    fn non_huawei_vendor_without_esm_model_is_flagged() {
        let combined = "VendorName=Acme\nModel=XJ-1\n";
        let info = parse_device_info_from_combined(combined);
        assert!(!info.is_huawei);
    }

    #[test]
    fn elabel_prefix_variant_is_recognized() {
        let combined = "/$ElabelVersion=002\n";
        let info = parse_device_info_from_combined(combined);
        assert_eq!(info.elabel_version.as_deref(), Some("002"));
    }
}
