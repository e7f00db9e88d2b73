//! Device aspects built from coded properties
//!
//! Drivers compose these instead of inheriting behavior: a receiver zone is
//! a [`Power`], a [`Sound`] and a [`Selection`] of inputs; a disc player adds
//! a [`Menu`].

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::command_channel::CommandChannel;
use crate::error::{DeviceError, Result};
use crate::property::{Attachable, CodeTable, CodedProperty, ListenerId, QUERY};

// ============================================================================
// Power
// ============================================================================

/// On/off switch. Unknown status reads as off.
pub struct Power {
    property: CodedProperty<bool>,
}

impl Power {
    /// Uses the `On`, `Off` and `Query` entries of `codes`.
    pub fn new(name: impl Into<String>, codes: &CodeTable) -> Result<Self> {
        Ok(Self {
            property: CodedProperty::with_codes(name, codes.filter(&["On", "Off", QUERY]))?,
        })
    }

    pub fn power_on(&self) -> Result<()> {
        self.property.fire("On")
    }

    pub fn power_off(&self) -> Result<()> {
        self.property.fire("Off")
    }

    pub fn is_powered(&self) -> bool {
        self.property.status() == Some(true)
    }

    pub fn status(&self) -> Option<bool> {
        self.property.status()
    }

    pub fn set_status(&self, powered: Option<bool>) -> bool {
        self.property.set_status(powered)
    }

    pub fn property(&self) -> &CodedProperty<bool> {
        &self.property
    }
}

impl Attachable for Power {
    fn name(&self) -> &str {
        self.property.name()
    }

    fn attach(&self, channel: Option<CommandChannel>) {
        self.property.attach(channel);
    }

    fn reset(&self) {
        self.property.set_status(None);
    }

    fn is_known(&self) -> bool {
        self.property.is_known()
    }

    fn query(&self) -> Result<()> {
        self.property.query()
    }
}

impl fmt::Debug for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.property, f)
    }
}

// ============================================================================
// Sound
// ============================================================================

/// Volume and mute.
///
/// Codes are read from `volume.*` (`Set` template, `Query`, optional `Min`
/// and `Max`) and `mute.*` (`On`, `Off`, `Query`).
pub struct Sound {
    name: String,
    volume: CodedProperty<i32>,
    mute: CodedProperty<bool>,
    range: Option<RangeInclusive<i32>>,
}

impl Sound {
    pub fn new(name: impl Into<String>, codes: &CodeTable) -> Result<Self> {
        let name = name.into();
        let volume_codes = codes.subset("volume");
        let max = limit(&name, &volume_codes, "Max")?;
        let min = limit(&name, &volume_codes, "Min")?;
        let range = max
            .filter(|max| *max > 0)
            .map(|max| min.filter(|min| *min >= 0).unwrap_or(0)..=max);

        Ok(Self {
            volume: CodedProperty::with_codes(
                format!("{}.volume", name),
                volume_codes.filter(&["Set", QUERY]),
            )?,
            mute: CodedProperty::with_codes(
                format!("{}.mute", name),
                codes.subset("mute").filter(&["On", "Off", QUERY]),
            )?,
            name,
            range,
        })
    }

    /// Set the volume, unmuting if muted.
    pub fn set_volume(&self, volume: i32) -> Result<()> {
        if let Some(range) = &self.range {
            if !range.contains(&volume) {
                return Err(DeviceError::InvalidValue {
                    property: self.volume.name().to_string(),
                    value: volume.to_string(),
                });
            }
        }
        self.volume.fire_formatted("Set", volume)?;
        if self.is_muted() {
            self.mute(false)?;
        }
        Ok(())
    }

    pub fn volume(&self) -> Option<i32> {
        self.volume.status()
    }

    pub fn volume_range(&self) -> Option<RangeInclusive<i32>> {
        self.range.clone()
    }

    pub fn set_volume_status(&self, volume: Option<i32>) -> bool {
        self.volume.set_status(volume)
    }

    pub fn mute(&self, on: bool) -> Result<()> {
        self.mute.fire(if on { "On" } else { "Off" })
    }

    pub fn is_muted(&self) -> bool {
        self.mute.status() == Some(true)
    }

    pub fn set_mute_status(&self, muted: Option<bool>) -> bool {
        self.mute.set_status(muted)
    }

    pub fn volume_property(&self) -> &CodedProperty<i32> {
        &self.volume
    }

    pub fn mute_property(&self) -> &CodedProperty<bool> {
        &self.mute
    }
}

fn limit(name: &str, codes: &CodeTable, key: &str) -> Result<Option<i32>> {
    let Some(value) = codes.get(key).and_then(|values| values.first()) else {
        return Ok(None);
    };
    value.trim().parse().map(Some).map_err(|_| {
        DeviceError::Configuration(format!("{}: volume {} '{}' is not a number", name, key, value))
    })
}

impl Attachable for Sound {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, channel: Option<CommandChannel>) {
        self.volume.attach(channel.clone());
        self.mute.attach(channel);
    }

    fn reset(&self) {
        self.volume.set_status(None);
        self.mute.set_status(None);
    }

    fn is_known(&self) -> bool {
        self.volume.is_known() && self.mute.is_known()
    }

    fn query(&self) -> Result<()> {
        let properties: [&dyn Attachable; 2] = [&self.volume, &self.mute];
        for property in properties {
            if let Err(e) = property.query() {
                debug!("{}: {}", self.name, e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Sound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(Vol:{:?},Mute:{:?})",
            self.name,
            self.volume.status(),
            self.mute.status()
        )
    }
}

// ============================================================================
// Selection
// ============================================================================

/// One of a set of named options, such as an input or listening mode.
///
/// With a `Set` template the option is substituted into it; otherwise each
/// option is itself a command of the table.
pub struct Selection {
    property: CodedProperty<String>,
    options: Vec<String>,
    formatted: bool,
}

impl Selection {
    /// Options are the table's commands, or none if it has a `Set` template.
    pub fn new(name: impl Into<String>, codes: &CodeTable) -> Result<Self> {
        let formatted = codes.contains("Set");
        let options = if formatted {
            Vec::new()
        } else {
            codes
                .commands()
                .filter(|command| *command != QUERY)
                .map(str::to_string)
                .collect()
        };
        Ok(Self {
            property: CodedProperty::with_codes(name, codes.clone())?,
            options,
            formatted,
        })
    }

    pub fn with_options<I, S>(name: impl Into<String>, codes: &CodeTable, options: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selection = Self::new(name, codes)?;
        selection.options.clear();
        for option in options {
            let option = option.into();
            if !selection.options.contains(&option) {
                selection.options.push(option);
            }
        }
        Ok(selection)
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn select(&self, option: &str) -> Result<()> {
        self.check(option)?;
        if self.formatted {
            self.property.fire_formatted("Set", option)
        } else {
            self.property.fire(option)
        }
    }

    pub fn selection(&self) -> Option<String> {
        self.property.status()
    }

    /// Record the reported option. Options outside the known set are
    /// rejected.
    pub fn set_status(&self, option: Option<String>) -> Result<bool> {
        if let Some(option) = &option {
            self.check(option)?;
        }
        Ok(self.property.set_status(option))
    }

    pub fn property(&self) -> &CodedProperty<String> {
        &self.property
    }

    fn check(&self, option: &str) -> Result<()> {
        if self.options.iter().any(|known| known == option) {
            Ok(())
        } else {
            Err(DeviceError::InvalidValue {
                property: self.property.name().to_string(),
                value: option.to_string(),
            })
        }
    }
}

impl Attachable for Selection {
    fn name(&self) -> &str {
        self.property.name()
    }

    fn attach(&self, channel: Option<CommandChannel>) {
        self.property.attach(channel);
    }

    fn reset(&self) {
        self.property.set_status(None);
    }

    fn is_known(&self) -> bool {
        self.property.is_known()
    }

    fn query(&self) -> Result<()> {
        self.property.query()
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.property, f)
    }
}

// ============================================================================
// Menu
// ============================================================================

/// Stateless navigation actions such as `Up` or `Enter`
pub struct Menu {
    property: CodedProperty<()>,
}

impl Menu {
    pub fn new(name: impl Into<String>, codes: &CodeTable) -> Result<Self> {
        Ok(Self {
            property: CodedProperty::with_codes(name, codes.clone())?,
        })
    }

    pub fn action(&self, action: &str) -> Result<()> {
        self.property.fire(action)
    }

    pub fn actions(&self) -> Vec<String> {
        self.property
            .codes()
            .commands()
            .map(str::to_string)
            .collect()
    }
}

impl Attachable for Menu {
    fn name(&self) -> &str {
        self.property.name()
    }

    fn attach(&self, channel: Option<CommandChannel>) {
        self.property.attach(channel);
    }

    fn reset(&self) {}

    fn is_known(&self) -> bool {
        true
    }

    fn query(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// QueryOnPower
// ============================================================================

/// Refreshes dependent properties when power changes.
///
/// Powering on queries every target whose status is unknown. Powering off
/// resets every target, since devices stop reporting while in standby.
pub struct QueryOnPower {
    targets: Vec<Arc<dyn Attachable>>,
}

impl QueryOnPower {
    pub fn new(targets: Vec<Arc<dyn Attachable>>) -> Self {
        Self { targets }
    }

    /// Listen to `power` and apply [`on_power_change`](Self::on_power_change)
    /// on every change.
    pub fn install(power: &Arc<Power>, targets: Vec<Arc<dyn Attachable>>) -> ListenerId {
        let handler = Self::new(targets);
        let power_ref: Weak<Power> = Arc::downgrade(power);
        power.property().add_listener(move |_| {
            if let Some(power) = power_ref.upgrade() {
                handler.on_power_change(power.is_powered());
            }
        })
    }

    pub fn on_power_change(&self, powered: bool) {
        for target in &self.targets {
            if !powered {
                target.reset();
            } else if !target.is_known() {
                if let Err(e) = target.query() {
                    debug!("Unable to query {}: {}", target.name(), e);
                }
            }
        }
    }
}
