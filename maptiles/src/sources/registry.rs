use super::{MapSourceDesc, maps_for_free, openstreetmap, openweathermap};

/// Every source this crate knows out of the box.
pub fn presets() -> Vec<MapSourceDesc> {
    vec![
        openstreetmap::mapnik(),
        openstreetmap::cycle_map(),
        openstreetmap::transport_map(),
        maps_for_free::relief(),
        openweathermap::clouds(),
        openweathermap::wind(),
        openweathermap::temperature(),
        openweathermap::precipitation(),
        openweathermap::pressure(),
    ]
}

/// Collection of [`MapSourceDesc`], looked up by their ids. Keeps the order in which sources
/// were added.
#[derive(Debug, Clone, Default)]
pub struct MapSourceRegistry {
    sources: Vec<MapSourceDesc>,
}

impl MapSourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all the [`presets`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.populate_defaults();
        registry
    }

    /// Add [`presets`] which are not in the registry yet. Sources added before under the same
    /// id are left alone.
    pub fn populate_defaults(&mut self) {
        for desc in presets() {
            self.add(desc);
        }
    }

    /// Returns false, and keeps the registry untouched, if there is a source with this id
    /// already.
    pub fn add(&mut self, desc: MapSourceDesc) -> bool {
        if self.by_id(&desc.id).is_some() {
            log::debug!("Source '{}' is registered already.", desc.id);
            return false;
        }

        self.sources.push(desc);
        true
    }

    pub fn by_id(&self, id: &str) -> Option<&MapSourceDesc> {
        self.sources.iter().find(|desc| desc.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<MapSourceDesc> {
        let index = self.sources.iter().position(|desc| desc.id == id)?;
        Some(self.sources.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapSourceDesc> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
