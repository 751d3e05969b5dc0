use super::MapSourceDesc;
use crate::{Projection, ZoomRange};

/// Identifier of the [`mapnik`] source.
pub const MAPNIK: &str = "osm-mapnik";

/// Identifier of the [`cycle_map`] source.
pub const CYCLE_MAP: &str = "osm-cyclemap";

/// Identifier of the [`transport_map`] source.
pub const TRANSPORT_MAP: &str = "osm-transportmap";

const ZOOM_RANGE: ZoomRange = ZoomRange::known(0, 18);
const COMMUNITY_LICENSE: &str = "Map data is CC-BY-SA 2.0 OpenStreetMap contributors";
const LICENSE_URL: &str = "http://creativecommons.org/licenses/by-sa/2.0/";

fn desc(id: &str, name: &str, license: &str, url_template: &str) -> MapSourceDesc {
    MapSourceDesc {
        id: id.to_owned(),
        name: name.to_owned(),
        license: license.to_owned(),
        license_url: LICENSE_URL.to_owned(),
        zoom_range: ZOOM_RANGE,
        tile_size: 256,
        projection: Projection::Mercator,
        url_template: url_template.to_owned(),
    }
}

/// Standard OpenStreetMap tiles.
/// <https://www.openstreetmap.org/about>
pub fn mapnik() -> MapSourceDesc {
    desc(
        MAPNIK,
        "OpenStreetMap Mapnik",
        "Map Data ODBL OpenStreetMap Contributors, Map Imagery CC-BY-SA 2.0 OpenStreetMap",
        "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
    )
}

/// Cycling routes on top of OpenStreetMap data.
pub fn cycle_map() -> MapSourceDesc {
    desc(
        CYCLE_MAP,
        "OpenStreetMap Cycle Map",
        COMMUNITY_LICENSE,
        "http://tile.opencyclemap.org/cycle/{z}/{x}/{y}.png",
    )
}

/// Public transport lines on top of OpenStreetMap data.
pub fn transport_map() -> MapSourceDesc {
    desc(
        TRANSPORT_MAP,
        "OpenStreetMap Transport Map",
        COMMUNITY_LICENSE,
        "http://tile.xn--pnvkarte-m4a.de/tilegen/{z}/{x}/{y}.png",
    )
}
