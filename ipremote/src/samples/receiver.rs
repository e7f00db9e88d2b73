//! Three-zone AV receiver speaking the VSX-1123 line protocol
//!
//! Status lines are a mnemonic followed by the value: `PWR0` (main zone on),
//! `VOL054`, `MUT1` (not muted), `FN25` (input 25). Power and mute use `0`
//! for on. Errors come back as `E` plus a two digit code; `E02` is the
//! normal answer to most queries while the main zone is in standby.

use std::sync::Arc;

use ipremote_device::{
    Attachable, CodeTable, CodedProperty, DeviceDriver, Power, PortSource, QueryOnPower,
    Response, Selection, Sound,
};
use ipremote_discovery::{DeviceMatcher, MatchStrategy};
use tracing::{debug, warn};

use crate::error::Result;

/// Input codes and their front-panel labels
pub const INPUTS: &[(&str, &str)] = &[
    ("25", "BD"),
    ("04", "DVD"),
    ("06", "SAT/CBL"),
    ("15", "DVR/BDR"),
    ("10", "VIDEO 1"),
    ("19", "HDMI 1"),
    ("20", "HDMI 2"),
    ("21", "HDMI 3"),
    ("22", "HDMI 4"),
    ("23", "HDMI 5"),
    ("24", "HDMI 6"),
    ("02", "TUNER"),
    ("01", "CD"),
    ("17", "iPod/USB"),
    ("26", "NETWORK"),
];

/// Listening mode codes and their labels
pub const LISTENING_MODES: &[(&str, &str)] = &[
    ("0001", "STEREO"),
    ("0005", "AUTO SURR/STREAM DIRECT"),
    ("0006", "AUTO SURROUND"),
    ("0007", "DIRECT"),
    ("0008", "PURE DIRECT"),
    ("0010", "STANDARD"),
    ("0101", "ACTION"),
    ("0103", "DRAMA"),
    ("0118", "ADVANCED GAME"),
    ("0151", "AUTO LEVEL CONTROL"),
];

fn codes() -> CodeTable {
    CodeTable::from_pairs([
        ("zone1.power.On", "PO"),
        ("zone1.power.Off", "PF"),
        ("zone1.power.Query", "?P"),
        ("zone1.sound.volume.Set", "%03dVL"),
        ("zone1.sound.volume.Query", "?V"),
        ("zone1.sound.volume.Max", "185"),
        ("zone1.sound.mute.On", "MO"),
        ("zone1.sound.mute.Off", "MF"),
        ("zone1.sound.mute.Query", "?M"),
        ("zone1.input.Set", "%02dFN"),
        ("zone1.input.Query", "?F"),
        ("zone1.listening.Set", "%04dSR"),
        ("zone1.listening.Query", "?S"),
        ("zone2.power.On", "APO"),
        ("zone2.power.Off", "APF"),
        ("zone2.power.Query", "?AP"),
        ("zone2.sound.volume.Set", "%03dZV"),
        ("zone2.sound.volume.Query", "?ZV"),
        ("zone2.sound.volume.Max", "81"),
        ("zone2.sound.mute.On", "Z2MO"),
        ("zone2.sound.mute.Off", "Z2MF"),
        ("zone2.sound.mute.Query", "?Z2M"),
        ("zone2.input.Set", "%02dZS"),
        ("zone2.input.Query", "?ZS"),
        ("zoneHDMI.power.On", "ZEO"),
        ("zoneHDMI.power.Off", "ZEF"),
        ("zoneHDMI.power.Query", "?ZEP"),
        ("zoneHDMI.input.Set", "%02dZEA"),
        ("zoneHDMI.input.Query", "?ZEA"),
        ("display.Query", "?FL"),
    ])
}

/// One zone: power and input, plus sound where the zone has amplification.
pub struct Zone {
    power: Arc<Power>,
    input: Arc<Selection>,
    sound: Option<Arc<Sound>>,
}

impl Zone {
    fn new(name: &str, codes: &CodeTable, with_sound: bool) -> Result<Self> {
        let power = Arc::new(Power::new(format!("AVR.{}.power", name), &codes.subset("power"))?);
        let input = Arc::new(Selection::with_options(
            format!("AVR.{}.input", name),
            &codes.subset("input"),
            INPUTS.iter().map(|(code, _)| *code),
        )?);
        let sound = if with_sound {
            Some(Arc::new(Sound::new(format!("AVR.{}.sound", name), &codes.subset("sound"))?))
        } else {
            None
        };
        Ok(Self { power, input, sound })
    }

    pub fn power(&self) -> &Arc<Power> {
        &self.power
    }

    pub fn input(&self) -> &Arc<Selection> {
        &self.input
    }

    pub fn sound(&self) -> Option<&Arc<Sound>> {
        self.sound.as_ref()
    }

    /// Everything refreshed when this zone powers on
    fn dependents(&self) -> Vec<Arc<dyn Attachable>> {
        let mut dependents: Vec<Arc<dyn Attachable>> = vec![self.input.clone()];
        if let Some(sound) = &self.sound {
            dependents.push(sound.clone());
        }
        dependents
    }

    fn report_power(&self, value: &str) {
        self.power.set_status(Some(value == "0"));
    }

    fn report_volume(&self, value: &str) {
        let Some(sound) = &self.sound else {
            return;
        };
        match value.parse::<i32>() {
            Ok(volume) => {
                sound.set_volume_status(Some(volume));
            }
            Err(_) => warn!("Unreadable volume '{}'", value),
        }
    }

    fn report_mute(&self, value: &str) {
        if let Some(sound) = &self.sound {
            sound.set_mute_status(Some(value == "0"));
        }
    }

    fn report_input(&self, value: &str) {
        if let Err(e) = self.input.set_status(Some(value.to_string())) {
            warn!("{}", e);
        }
    }
}

/// Pioneer VSX-1123 receiver with main, second and HDMI zones.
pub struct Receiver {
    zone1: Zone,
    zone2: Zone,
    zone_hdmi: Zone,
    listening: Arc<Selection>,
    display: Arc<CodedProperty<String>>,
}

impl Receiver {
    pub const NAME: &'static str = "VSX-1123";

    pub fn new() -> Result<Self> {
        let codes = codes();
        let zone1 = Zone::new("zone1", &codes.subset("zone1"), true)?;
        let zone2 = Zone::new("zone2", &codes.subset("zone2"), true)?;
        let zone_hdmi = Zone::new("zoneHDMI", &codes.subset("zoneHDMI"), false)?;
        let listening = Arc::new(Selection::with_options(
            "AVR.zone1.listening",
            &codes.subset("zone1.listening"),
            LISTENING_MODES.iter().map(|(code, _)| *code),
        )?);
        let display = Arc::new(CodedProperty::with_codes(
            "AVR.display",
            codes.subset("display"),
        )?);

        let mut zone1_dependents = zone1.dependents();
        zone1_dependents.push(listening.clone());
        QueryOnPower::install(&zone1.power, zone1_dependents);
        QueryOnPower::install(&zone2.power, zone2.dependents());
        QueryOnPower::install(&zone_hdmi.power, zone_hdmi.dependents());

        Ok(Self {
            zone1,
            zone2,
            zone_hdmi,
            listening,
            display,
        })
    }

    pub fn zone1(&self) -> &Zone {
        &self.zone1
    }

    pub fn zone2(&self) -> &Zone {
        &self.zone2
    }

    pub fn zone_hdmi(&self) -> &Zone {
        &self.zone_hdmi
    }

    pub fn listening_mode(&self) -> &Arc<Selection> {
        &self.listening
    }

    /// Front-panel text, empty when unknown
    pub fn display(&self) -> String {
        self.display.status().unwrap_or_default()
    }

    pub fn display_property(&self) -> &Arc<CodedProperty<String>> {
        &self.display
    }

    fn report_display(&self, hex: &str) {
        match decode_hex(hex) {
            Some(text) => {
                let text = text.trim().to_string();
                debug!("Display: {}", text);
                self.display.set_status(Some(text));
            }
            None => warn!("Unreadable display '{}'", hex),
        }
    }
}

impl DeviceDriver for Receiver {
    fn name(&self) -> &str {
        Self::NAME
    }

    // The receiver reports its model number as friendly name, and the
    // model name carries the region suffix.
    fn matcher(&self) -> Arc<dyn MatchStrategy> {
        Arc::new(
            DeviceMatcher::new()
                .device_type("urn:schemas-upnp-org:device:MediaRenderer:1")
                .friendly_name("VSX-1123")
                .model_name("VSX-1123/CUXESM"),
        )
    }

    fn port(&self) -> PortSource {
        PortSource::Description
    }

    fn properties(&self) -> Vec<Arc<dyn Attachable>> {
        let mut properties: Vec<Arc<dyn Attachable>> = Vec::new();
        for zone in [&self.zone1, &self.zone2, &self.zone_hdmi] {
            properties.push(zone.power.clone());
            properties.extend(zone.dependents());
        }
        properties.push(self.listening.clone());
        properties.push(self.display.clone());
        properties
    }

    fn handle_response(&self, line: &str, outstanding: Option<&str>) -> Response {
        let mnemonic = if let Some(value) = line.strip_prefix("PWR") {
            self.zone1.report_power(value);
            "PWR"
        } else if let Some(value) = line.strip_prefix("APR") {
            self.zone2.report_power(value);
            "APR"
        } else if let Some(value) = line.strip_prefix("ZEP") {
            self.zone_hdmi.report_power(value);
            "ZEP"
        } else if let Some(value) = line.strip_prefix("VOL") {
            self.zone1.report_volume(value);
            "VOL"
        } else if let Some(value) = line.strip_prefix("ZV") {
            self.zone2.report_volume(value);
            "ZV"
        } else if let Some(value) = line.strip_prefix("MUT") {
            self.zone1.report_mute(value);
            "MUT"
        } else if let Some(value) = line.strip_prefix("Z2MUT") {
            self.zone2.report_mute(value);
            "Z2MUT"
        } else if let Some(value) = line.strip_prefix("FN") {
            self.zone1.report_input(value);
            "FN"
        } else if let Some(value) = line.strip_prefix("Z2F") {
            self.zone2.report_input(value);
            "Z2F"
        } else if let Some(value) = line.strip_prefix("ZEA") {
            self.zone_hdmi.report_input(value);
            "ZEA"
        } else if let Some(value) = line.strip_prefix("FL") {
            self.report_display(value);
            "FL"
        } else if let Some(value) = line.strip_prefix("SR") {
            if let Err(e) = self.listening.set_status(Some(value.to_string())) {
                warn!("{}", e);
            }
            "SR"
        } else if line.starts_with('E') && line.len() == 3 {
            let Some(command) = outstanding else {
                debug!("Error {} with nothing outstanding", line);
                return Response::Unsolicited;
            };
            if line == "E02" && !self.zone1.power.is_powered() {
                debug!("E02 for {} while the main zone is in standby", command);
                return Response::Handled;
            }
            warn!("Receiver rejected {}: {}", command, line);
            return Response::Failed;
        } else {
            // LM, AU and VTA report parameters nothing here tracks.
            debug!("Unhandled response: {}", line);
            return Response::Unsolicited;
        };

        match outstanding.and_then(answered_by) {
            Some(expected) if expected == mnemonic => Response::Handled,
            _ => Response::Unsolicited,
        }
    }
}

/// Status mnemonic the receiver answers `command` with. Set commands carry
/// their value as leading digits.
fn answered_by(command: &str) -> Option<&'static str> {
    let mnemonic = match command.trim_start_matches(|c: char| c.is_ascii_digit()) {
        "PO" | "PF" | "?P" => "PWR",
        "APO" | "APF" | "?AP" => "APR",
        "ZEO" | "ZEF" | "?ZEP" => "ZEP",
        "VL" | "?V" => "VOL",
        "ZV" | "?ZV" => "ZV",
        "MO" | "MF" | "?M" => "MUT",
        "Z2MO" | "Z2MF" | "?Z2M" => "Z2MUT",
        "FN" | "?F" => "FN",
        "ZS" | "?ZS" => "Z2F",
        "ZEA" | "?ZEA" => "ZEA",
        "SR" | "?S" => "SR",
        "?FL" => "FL",
        _ => return None,
    };
    Some(mnemonic)
}

fn decode_hex(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .map(char::from)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipremote_discovery::DeviceDescription;
    use rstest::rstest;

    fn receiver() -> Receiver {
        Receiver::new().unwrap()
    }

    #[test]
    fn test_matches_receiver_description() {
        let mut description = DeviceDescription::default();
        description.device_type = "urn:schemas-upnp-org:device:MediaRenderer:1".to_string();
        description.friendly_name = "VSX-1123".to_string();
        description.model_name = "VSX-1123/CUXESM".to_string();
        let source = "192.168.1.20:1900".parse().unwrap();

        let matcher = receiver().matcher();
        assert!(matcher.matches(&description, source));

        description.model_name = "VSX-923/CUXESM".to_string();
        assert!(!matcher.matches(&description, source));
    }

    #[rstest]
    #[case("PWR0", Some(true))]
    #[case("PWR1", Some(false))]
    fn test_main_zone_power(#[case] line: &str, #[case] expected: Option<bool>) {
        let receiver = receiver();
        assert_eq!(receiver.handle_response(line, Some("?P")), Response::Handled);
        assert_eq!(receiver.zone1().power().status(), expected);
        assert_eq!(receiver.zone2().power().status(), None);
    }

    #[test]
    fn test_zone_reports() {
        let receiver = receiver();

        receiver.handle_response("VOL054", None);
        receiver.handle_response("ZV042", None);
        receiver.handle_response("MUT0", None);
        receiver.handle_response("Z2MUT1", None);
        receiver.handle_response("FN25", None);
        receiver.handle_response("Z2F02", None);
        receiver.handle_response("ZEA24", None);
        receiver.handle_response("SR0006", None);

        let zone1_sound = receiver.zone1().sound().unwrap();
        let zone2_sound = receiver.zone2().sound().unwrap();
        assert_eq!(zone1_sound.volume(), Some(54));
        assert_eq!(zone2_sound.volume(), Some(42));
        assert!(zone1_sound.is_muted());
        assert!(!zone2_sound.is_muted());
        assert_eq!(receiver.zone1().input().selection().as_deref(), Some("25"));
        assert_eq!(receiver.zone2().input().selection().as_deref(), Some("02"));
        assert_eq!(receiver.zone_hdmi().input().selection().as_deref(), Some("24"));
        assert_eq!(receiver.listening_mode().selection().as_deref(), Some("0006"));
    }

    #[test]
    fn test_bad_values_keep_last_state() {
        let receiver = receiver();
        receiver.handle_response("VOL054", None);

        assert_eq!(receiver.handle_response("VOLxyz", Some("?V")), Response::Handled);
        assert_eq!(receiver.handle_response("FN99", Some("?F")), Response::Handled);

        assert_eq!(receiver.zone1().sound().unwrap().volume(), Some(54));
        assert_eq!(receiver.zone1().input().selection(), None);
    }

    #[test]
    fn test_errors() {
        let receiver = receiver();
        assert_eq!(receiver.handle_response("E02", Some("?V")), Response::Handled);
        assert_eq!(receiver.handle_response("E04", Some("?V")), Response::Failed);

        receiver.handle_response("PWR0", None);
        assert_eq!(receiver.handle_response("E02", Some("?V")), Response::Failed);
        assert_eq!(receiver.handle_response("E04", None), Response::Unsolicited);
        assert_eq!(receiver.handle_response("LM0401", None), Response::Unsolicited);
    }

    #[rstest]
    #[case("PWR0", "PO")]
    #[case("APR1", "APF")]
    #[case("ZEP0", "?ZEP")]
    #[case("VOL101", "101VL")]
    #[case("VOL101", "?V")]
    #[case("ZV040", "040ZV")]
    #[case("MUT0", "MO")]
    #[case("Z2MUT1", "?Z2M")]
    #[case("FN19", "19FN")]
    #[case("Z2F04", "04ZS")]
    #[case("ZEA22", "?ZEA")]
    #[case("SR0101", "0101SR")]
    #[case("FL2020564F4C554D452020", "?FL")]
    fn test_reply_acknowledges_its_command(#[case] line: &str, #[case] outstanding: &str) {
        assert_eq!(receiver().handle_response(line, Some(outstanding)), Response::Handled);
    }

    #[rstest]
    #[case("FL2020564F4C554D452020", Some("?P"))]
    #[case("FL2020564F4C554D452020", None)]
    #[case("PWR0", Some("?V"))]
    #[case("VOL054", Some("?ZV"))]
    #[case("MUT0", Some("Z2MO"))]
    #[case("Z2MUT0", Some("MO"))]
    #[case("FN25", Some("?ZS"))]
    #[case("PWR0", None)]
    fn test_unrelated_reply_leaves_command_outstanding(
        #[case] line: &str,
        #[case] outstanding: Option<&str>,
    ) {
        assert_eq!(receiver().handle_response(line, outstanding), Response::Unsolicited);
    }

    #[test]
    fn test_unsolicited_reply_still_updates_state() {
        let receiver = receiver();
        assert_eq!(receiver.handle_response("VOL054", Some("?P")), Response::Unsolicited);
        assert_eq!(receiver.zone1().sound().unwrap().volume(), Some(54));
        assert_eq!(receiver.handle_response("PWR0", Some("?P")), Response::Handled);
        assert!(receiver.zone1().power().is_powered());
    }

    #[test]
    fn test_display() {
        let receiver = receiver();
        receiver.handle_response("FL2020564F4C554D452020", None);
        assert_eq!(receiver.display(), "VOLUME");

        receiver.handle_response("FL2G", None);
        assert_eq!(receiver.display(), "VOLUME");
    }

    #[test]
    fn test_power_off_resets_zone() {
        let receiver = receiver();
        receiver.handle_response("PWR0", None);
        receiver.handle_response("FN25", None);
        receiver.handle_response("SR0001", None);

        receiver.handle_response("PWR1", None);
        assert_eq!(receiver.zone1().input().selection(), None);
        assert_eq!(receiver.listening_mode().selection(), None);
    }

    #[test]
    fn test_properties_cover_every_zone() {
        let names: Vec<String> = receiver()
            .properties()
            .iter()
            .map(|property| property.name().to_string())
            .collect();

        assert_eq!(
            names,
            vec![
                "AVR.zone1.power",
                "AVR.zone1.input",
                "AVR.zone1.sound",
                "AVR.zone2.power",
                "AVR.zone2.input",
                "AVR.zone2.sound",
                "AVR.zoneHDMI.power",
                "AVR.zoneHDMI.input",
                "AVR.zone1.listening",
                "AVR.display",
            ]
        );
    }
}
