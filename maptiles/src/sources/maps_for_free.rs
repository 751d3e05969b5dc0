use super::MapSourceDesc;
use crate::{Projection, ZoomRange};

/// Identifier of the [`relief`] source.
pub const RELIEF: &str = "mff-relief";

/// Shaded relief, without any roads or labels.
/// <https://maps-for-free.com>
pub fn relief() -> MapSourceDesc {
    MapSourceDesc {
        id: RELIEF.to_owned(),
        name: "Maps for Free Relief".to_owned(),
        license: "Map data available under GNU Free Documentation license, Version 1.2 or later"
            .to_owned(),
        license_url: "http://www.gnu.org/copyleft/fdl.html".to_owned(),
        zoom_range: const { ZoomRange::known(0, 11) },
        tile_size: 256,
        projection: Projection::Mercator,
        url_template: "http://maps-for-free.com/layer/relief/z{z}/row{y}/{z}_{x}-{y}.jpg"
            .to_owned(),
    }
}
