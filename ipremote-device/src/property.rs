//! Coded properties: a command table plus the last status the device reported
//!
//! A [`CodedProperty`] knows which literal wire codes implement each of its
//! commands (`On` → `PN\r`), writes them through the device's
//! [`CommandChannel`] and keeps the status parsed from the device's
//! responses. Listeners are told whenever that status actually changes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::command_channel::CommandChannel;
use crate::error::{DeviceError, Result};

/// Command sent when a property is attached and by `query()`
pub const QUERY: &str = "Query";

// ============================================================================
// Code tables
// ============================================================================

/// Command name → ordered wire codes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeTable {
    codes: BTreeMap<String, Vec<String>>,
}

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(command, codes)` pairs where `codes` is comma separated.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut table = Self::new();
        for (command, codes) in pairs {
            table.insert(command, codes.as_ref());
        }
        table
    }

    /// Add `command` with comma separated `codes`
    pub fn with(mut self, command: impl Into<String>, codes: &str) -> Self {
        self.insert(command, codes);
        self
    }

    pub fn insert(&mut self, command: impl Into<String>, codes: &str) {
        self.codes.insert(
            command.into(),
            codes.split(',').map(str::to_string).collect(),
        );
    }

    pub fn get(&self, command: &str) -> Option<&[String]> {
        self.codes.get(command).map(Vec::as_slice)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.codes.contains_key(command)
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.codes.keys().map(String::as_str)
    }

    /// Only the given commands
    pub fn filter(&self, commands: &[&str]) -> Self {
        Self {
            codes: self
                .codes
                .iter()
                .filter(|(command, _)| commands.contains(&command.as_str()))
                .map(|(command, codes)| (command.clone(), codes.clone()))
                .collect(),
        }
    }

    /// Entries named `prefix.<command>`, with the prefix removed
    pub fn subset(&self, prefix: &str) -> Self {
        let prefix = format!("{}.", prefix);
        Self {
            codes: self
                .codes
                .iter()
                .filter_map(|(command, codes)| {
                    command
                        .strip_prefix(&prefix)
                        .map(|rest| (rest.to_string(), codes.clone()))
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    fn reverse(&self) -> std::result::Result<HashMap<String, String>, String> {
        let mut reverse = HashMap::new();
        for (command, codes) in &self.codes {
            let [code] = codes.as_slice() else {
                return Err(format!("command '{}' maps to {} codes", command, codes.len()));
            };
            if code.is_empty() {
                continue;
            }
            if let Some(previous) = reverse.insert(code.clone(), command.clone()) {
                return Err(format!(
                    "code '{}' is shared by '{}' and '{}'",
                    code.escape_debug(),
                    previous,
                    command
                ));
            }
        }
        Ok(reverse)
    }
}

// ============================================================================
// Formatted codes
// ============================================================================

/// Value substituted into a code template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeArg {
    Int(i64),
    Text(String),
}

impl From<i64> for CodeArg {
    fn from(value: i64) -> Self {
        CodeArg::Int(value)
    }
}

impl From<i32> for CodeArg {
    fn from(value: i32) -> Self {
        CodeArg::Int(value.into())
    }
}

impl From<u32> for CodeArg {
    fn from(value: u32) -> Self {
        CodeArg::Int(value.into())
    }
}

impl From<u8> for CodeArg {
    fn from(value: u8) -> Self {
        CodeArg::Int(value.into())
    }
}

impl From<&str> for CodeArg {
    fn from(value: &str) -> Self {
        CodeArg::Text(value.to_string())
    }
}

impl From<String> for CodeArg {
    fn from(value: String) -> Self {
        CodeArg::Text(value)
    }
}

impl fmt::Display for CodeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeArg::Int(value) => write!(f, "{}", value),
            CodeArg::Text(value) => f.write_str(value),
        }
    }
}

/// Substitute `arg` into the single `%d`, `%0Nd` or `%s` of `template`.
/// `%%` is a literal percent sign.
pub fn format_code(template: &str, arg: &CodeArg) -> std::result::Result<String, String> {
    let mut output = String::with_capacity(template.len() + 4);
    let mut substituted = false;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            output.push('%');
            continue;
        }
        if substituted {
            return Err(format!("'{}' has more than one placeholder", template.escape_debug()));
        }

        let mut width = String::new();
        while let Some(digit) = chars.peek().copied().filter(char::is_ascii_digit) {
            width.push(digit);
            chars.next();
        }
        let zero_padded = width.starts_with('0');
        let width: usize = if width.is_empty() {
            0
        } else {
            width
                .parse()
                .map_err(|_| format!("bad width in '{}'", template.escape_debug()))?
        };

        match chars.next() {
            Some('d') => {
                let value = match arg {
                    CodeArg::Int(value) => *value,
                    CodeArg::Text(text) => text
                        .trim()
                        .parse()
                        .map_err(|_| format!("'{}' is not a number", text))?,
                };
                if zero_padded {
                    output.push_str(&format!("{:0width$}", value, width = width));
                } else {
                    output.push_str(&format!("{:width$}", value, width = width));
                }
            }
            Some('s') => output.push_str(&format!("{:>width$}", arg.to_string(), width = width)),
            other => {
                return Err(format!(
                    "unsupported placeholder '%{}' in '{}'",
                    other.map(String::from).unwrap_or_default(),
                    template.escape_debug()
                ))
            }
        }
        substituted = true;
    }

    if !substituted {
        return Err(format!("'{}' has no placeholder", template.escape_debug()));
    }
    Ok(output)
}

// ============================================================================
// CodedProperty
// ============================================================================

/// Identifies a status listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type StatusListener = Arc<dyn Fn(&str) + Send + Sync>;

struct PropertyState<T> {
    codes: CodeTable,
    reverse: Option<HashMap<String, String>>,
    status: Option<T>,
    channel: Option<CommandChannel>,
}

/// A command table and the last status reported by the device.
pub struct CodedProperty<T> {
    name: String,
    state: Mutex<PropertyState<T>>,
    listeners: Mutex<Vec<(ListenerId, StatusListener)>>,
    next_listener_id: AtomicU64,
}

impl<T> CodedProperty<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Property with no codes yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PropertyState {
                codes: CodeTable::new(),
                reverse: None,
                status: None,
                channel: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn with_codes(name: impl Into<String>, codes: CodeTable) -> Result<Self> {
        let property = Self::new(name);
        property.set_codes(codes)?;
        Ok(property)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the code table. An empty table is rejected.
    pub fn set_codes(&self, codes: CodeTable) -> Result<()> {
        if codes.is_empty() {
            return Err(DeviceError::Configuration(format!(
                "no codes loaded for {}",
                self.name
            )));
        }
        let mut state = self.state.lock();
        state.codes = codes;
        state.reverse = None;
        Ok(())
    }

    pub fn codes(&self) -> CodeTable {
        self.state.lock().codes.clone()
    }

    pub fn has_command(&self, command: &str) -> bool {
        self.state.lock().codes.contains(command)
    }

    /// Write every code of `command`, in order.
    ///
    /// With no channel attached this logs and does nothing.
    pub fn fire(&self, command: &str) -> Result<()> {
        let (codes, channel) = {
            let state = self.state.lock();
            let codes = state
                .codes
                .get(command)
                .ok_or_else(|| self.unknown(command))?
                .to_vec();
            (codes, state.channel.clone())
        };
        self.write(command, codes, channel);
        Ok(())
    }

    /// Write the single code of `command` with `value` substituted into it.
    pub fn fire_formatted(&self, command: &str, value: impl Into<CodeArg>) -> Result<()> {
        let value = value.into();
        let (template, channel) = {
            let state = self.state.lock();
            let codes = state
                .codes
                .get(command)
                .ok_or_else(|| self.unknown(command))?;
            let [template] = codes else {
                return Err(DeviceError::Configuration(format!(
                    "{}.{} must have exactly one code to be formatted",
                    self.name, command
                )));
            };
            (template.clone(), state.channel.clone())
        };

        let code = format_code(&template, &value).map_err(|reason| DeviceError::InvalidValue {
            property: self.name.clone(),
            value: format!("{} ({})", value, reason),
        })?;
        self.write(command, vec![code], channel);
        Ok(())
    }

    pub fn query(&self) -> Result<()> {
        self.fire(QUERY)
    }

    pub fn status(&self) -> Option<T> {
        self.state.lock().status.clone()
    }

    /// Record a new status, notifying listeners if it differs from the last.
    /// Returns whether it changed.
    pub fn set_status(&self, status: Option<T>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status == status {
                return false;
            }
            trace!("{}: {:?} -> {:?}", self.name, state.status, status);
            state.status = status;
        }
        self.notify();
        true
    }

    pub fn is_known(&self) -> bool {
        self.state.lock().status.is_some()
    }

    /// Command whose single code is `code`, if any.
    ///
    /// Fails if the table cannot be reversed: a command with several codes,
    /// or two commands sharing one.
    pub fn command_for(&self, code: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        if state.reverse.is_none() {
            let reverse = state.codes.reverse().map_err(|reason| {
                DeviceError::Configuration(format!("{}: {}", self.name, reason))
            })?;
            state.reverse = Some(reverse);
        }
        Ok(state
            .reverse
            .as_ref()
            .and_then(|reverse| reverse.get(code).cloned()))
    }

    /// Attach or detach the device's command channel.
    ///
    /// Attaching queries the device if the table has a `Query` command.
    /// Detaching resets the status to unknown without any wire traffic.
    pub fn attach(&self, channel: Option<CommandChannel>) {
        let attached = channel.is_some();
        let has_query = {
            let mut state = self.state.lock();
            state.channel = channel;
            state.codes.contains(QUERY)
        };

        if !attached {
            self.set_status(None);
        } else if has_query {
            if let Err(e) = self.query() {
                warn!("{}: initial query failed: {}", self.name, e);
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    /// Call `listener` with this property's name on every status change.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    fn write(&self, command: &str, codes: Vec<String>, channel: Option<CommandChannel>) {
        let Some(channel) = channel else {
            error!(
                "{}: '{}' fired with no channel attached; codes {:?} not sent",
                self.name, command, codes
            );
            return;
        };
        for code in codes {
            trace!("{}: writing '{}' for '{}'", self.name, code.escape_debug(), command);
            channel.write(code.into_bytes());
        }
    }

    fn notify(&self) {
        let listeners: Vec<StatusListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&self.name);
        }
    }

    fn unknown(&self, command: &str) -> DeviceError {
        DeviceError::UnknownCommand {
            property: self.name.clone(),
            command: command.to_string(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CodedProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.name, self.state.lock().status)
    }
}

// ============================================================================
// Attachable
// ============================================================================

/// Anything a device pushes its command channel to.
pub trait Attachable: Send + Sync {
    fn name(&self) -> &str;

    /// Attach (`Some`) or detach (`None`) the command channel
    fn attach(&self, channel: Option<CommandChannel>);

    /// Forget the reported status without wire traffic
    fn reset(&self);

    /// True once the device has reported a status
    fn is_known(&self) -> bool;

    fn query(&self) -> Result<()>;
}

impl<T> Attachable for CodedProperty<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        CodedProperty::name(self)
    }

    fn attach(&self, channel: Option<CommandChannel>) {
        CodedProperty::attach(self, channel)
    }

    fn reset(&self) {
        self.set_status(None);
    }

    fn is_known(&self) -> bool {
        CodedProperty::is_known(self)
    }

    fn query(&self) -> Result<()> {
        CodedProperty::query(self)
    }
}
