//! Device groups by location and activity
//!
//! A group names the aspects used together for one activity in one place:
//! the devices to power, the sound to adjust, the menus to offer and the
//! input each device should be switched to. One group is active at a time;
//! its selections are applied whenever their device is powered.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ipremote_device::{DeviceError, ListenerId, Menu, Power, Selection, Sound};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{RemoteError, Result};

/// Location and activity of the empty group, active when nothing else is.
pub const NO_SELECTION: &str = "none";

/// Input a group switches a device to while that device is on
#[derive(Clone)]
pub struct GroupSelection {
    pub selection: Arc<Selection>,
    pub power: Arc<Power>,
    pub value: String,
}

/// Aspects used together for one activity at one location.
#[derive(Clone)]
pub struct DeviceGroup {
    location: String,
    activity: String,
    powered: Vec<Arc<Power>>,
    sound: Option<Arc<Sound>>,
    menus: Vec<(String, Arc<Menu>)>,
    selections: Vec<GroupSelection>,
}

impl DeviceGroup {
    pub fn new(location: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            activity: activity.into(),
            powered: Vec::new(),
            sound: None,
            menus: Vec::new(),
            selections: Vec::new(),
        }
    }

    pub fn with_power(mut self, power: Arc<Power>) -> Self {
        self.add_power(power);
        self
    }

    pub fn with_sound(mut self, sound: Arc<Sound>) -> Self {
        self.sound = Some(sound);
        self
    }

    /// Offer `menu` under `name`, replacing any menu of that name.
    pub fn with_menu(mut self, name: impl Into<String>, menu: Arc<Menu>) -> Self {
        let name = name.into();
        match self.menus.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = menu,
            None => self.menus.push((name, menu)),
        }
        self
    }

    /// Switch `selection` to `value` while `power` is on. `power` joins the
    /// group's powered devices.
    pub fn with_selection(
        mut self,
        selection: Arc<Selection>,
        power: Arc<Power>,
        value: impl Into<String>,
    ) -> Result<Self> {
        let value = value.into();
        if !selection.options().contains(&value) {
            return Err(DeviceError::InvalidValue {
                property: selection.property().name().to_string(),
                value,
            }
            .into());
        }
        self.add_power(Arc::clone(&power));
        self.selections.push(GroupSelection {
            selection,
            power,
            value,
        });
        Ok(self)
    }

    fn add_power(&mut self, power: Arc<Power>) {
        if !self.powered.iter().any(|existing| Arc::ptr_eq(existing, &power)) {
            self.powered.push(power);
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn powered(&self) -> &[Arc<Power>] {
        &self.powered
    }

    pub fn sound(&self) -> Option<&Arc<Sound>> {
        self.sound.as_ref()
    }

    pub fn menus(&self) -> impl Iterator<Item = (&str, &Arc<Menu>)> {
        self.menus.iter().map(|(name, menu)| (name.as_str(), menu))
    }

    pub fn menu(&self, name: &str) -> Option<&Arc<Menu>> {
        self.menus
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, menu)| menu)
    }

    pub fn selections(&self) -> &[GroupSelection] {
        &self.selections
    }

    fn is_for(&self, location: &str, activity: &str) -> bool {
        self.location == location && self.activity == activity
    }
}

impl fmt::Debug for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGroup")
            .field("location", &self.location)
            .field("activity", &self.activity)
            .field("powered", &self.powered.len())
            .field("sound", &self.sound.is_some())
            .field("menus", &self.menus.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("selections", &self.selections.len())
            .finish()
    }
}

/// Active group before and after a change. `None` is the empty group.
#[derive(Debug, Clone)]
pub struct GroupChange {
    pub previous: Option<Arc<DeviceGroup>>,
    pub current: Option<Arc<DeviceGroup>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupListenerId(u64);

type GroupListener = Arc<dyn Fn(&GroupChange) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    groups: Vec<Arc<DeviceGroup>>,
    active: Option<Arc<DeviceGroup>>,
    // Power listeners applying the active group's selections
    trackers: Vec<(Arc<Power>, ListenerId)>,
}

/// Groups keyed by location and activity, with one active group.
#[derive(Default)]
pub struct DeviceGroupRegistry {
    state: Mutex<RegistryState>,
    listeners: Mutex<Vec<(GroupListenerId, GroupListener)>>,
    next_listener_id: AtomicU64,
}

impl DeviceGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `group`, replacing the group of the same location and activity.
    /// A replaced active group stays active until the next change.
    pub fn register(&self, group: DeviceGroup) -> Result<()> {
        if group.is_for(NO_SELECTION, NO_SELECTION) {
            return Err(RemoteError::InvalidGroup(format!(
                "{}@{} is reserved",
                NO_SELECTION, NO_SELECTION
            )));
        }

        let mut state = self.state.lock();
        let index = state
            .groups
            .iter()
            .position(|existing| existing.is_for(&group.location, &group.activity));
        let group = Arc::new(group);
        match index {
            Some(index) => state.groups[index] = group,
            None => state.groups.push(group),
        }
        Ok(())
    }

    pub fn group(&self, location: &str, activity: &str) -> Option<Arc<DeviceGroup>> {
        self.state
            .lock()
            .groups
            .iter()
            .find(|group| group.is_for(location, activity))
            .cloned()
    }

    pub fn groups(&self) -> Vec<Arc<DeviceGroup>> {
        self.state.lock().groups.clone()
    }

    /// Every location, the empty group's first
    pub fn locations(&self) -> Vec<String> {
        self.collect(|group| Some(group.location.as_str()), true)
    }

    /// Every activity, the empty group's first
    pub fn activities(&self) -> Vec<String> {
        self.collect(|group| Some(group.activity.as_str()), true)
    }

    pub fn locations_for_activity(&self, activity: &str) -> Vec<String> {
        self.collect(
            |group| (group.activity == activity).then_some(group.location.as_str()),
            false,
        )
    }

    pub fn activities_for_location(&self, location: &str) -> Vec<String> {
        self.collect(
            |group| (group.location == location).then_some(group.activity.as_str()),
            false,
        )
    }

    fn collect<F>(&self, pick: F, with_empty: bool) -> Vec<String>
    where
        F: Fn(&DeviceGroup) -> Option<&str>,
    {
        let state = self.state.lock();
        let mut names: Vec<String> = Vec::new();
        if with_empty {
            names.push(NO_SELECTION.to_string());
        }
        for name in state.groups.iter().filter_map(|group| pick(group.as_ref())) {
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn active_group(&self) -> Option<Arc<DeviceGroup>> {
        self.state.lock().active.clone()
    }

    /// Make the group for `location` and `activity` active. Unknown pairs
    /// activate the empty group. Returns whether the active group changed.
    pub fn set_active_group(&self, location: &str, activity: &str) -> bool {
        let (change, released, to_apply) = {
            let mut state = self.state.lock();
            let next = state
                .groups
                .iter()
                .find(|group| group.is_for(location, activity))
                .cloned();
            let unchanged = match (&state.active, &next) {
                (Some(active), Some(next)) => Arc::ptr_eq(active, next),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return false;
            }
            if next.is_none() {
                debug!("No group for {}@{}; deactivating", activity, location);
            }

            let released = std::mem::take(&mut state.trackers);
            let mut to_apply = Vec::new();
            if let Some(group) = &next {
                for selection in &group.selections {
                    let id = track_selection(selection);
                    state.trackers.push((Arc::clone(&selection.power), id));
                    if selection.power.is_powered() {
                        to_apply.push(selection.clone());
                    }
                }
            }

            let previous = std::mem::replace(&mut state.active, next.clone());
            (
                GroupChange {
                    previous,
                    current: next,
                },
                released,
                to_apply,
            )
        };

        for (power, id) in released {
            power.property().remove_listener(id);
        }
        for selection in &to_apply {
            apply_selection(&selection.selection, &selection.value);
        }
        debug!("Active group {}@{}", activity, location);
        self.notify(&change);
        true
    }

    /// Activate the empty group.
    pub fn deactivate(&self) -> bool {
        self.set_active_group(NO_SELECTION, NO_SELECTION)
    }

    /// Deactivate and forget every group.
    pub fn clear(&self) {
        self.deactivate();
        self.state.lock().groups.clear();
    }

    /// Call `listener` whenever the active group changes.
    pub fn add_listener<F>(&self, listener: F) -> GroupListenerId
    where
        F: Fn(&GroupChange) + Send + Sync + 'static,
    {
        let id = GroupListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: GroupListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    fn notify(&self, change: &GroupChange) {
        let listeners: Vec<GroupListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

impl fmt::Debug for DeviceGroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeviceGroupRegistry")
            .field("groups", &state.groups)
            .field(
                "active",
                &state
                    .active
                    .as_ref()
                    .map(|group| format!("{}@{}", group.activity, group.location)),
            )
            .finish()
    }
}

/// Apply `selection` each time its device reports power on.
fn track_selection(selection: &GroupSelection) -> ListenerId {
    let target: Weak<Selection> = Arc::downgrade(&selection.selection);
    let power: Weak<Power> = Arc::downgrade(&selection.power);
    let value = selection.value.clone();
    selection.power.property().add_listener(move |_| {
        let (Some(target), Some(power)) = (target.upgrade(), power.upgrade()) else {
            return;
        };
        if power.is_powered() {
            apply_selection(&target, &value);
        }
    })
}

fn apply_selection(selection: &Selection, value: &str) {
    if let Err(e) = selection.select(value) {
        warn!("Unable to select {}: {}", value, e);
    }
}
