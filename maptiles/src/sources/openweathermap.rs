//! Weather overlays. They are transparent, so they are meant to be shown on top of another map.

use super::MapSourceDesc;
use crate::{Projection, ZoomRange};

pub const CLOUDS: &str = "owm-clouds";
pub const WIND: &str = "owm-wind";
pub const TEMPERATURE: &str = "owm-temperature";
pub const PRECIPITATION: &str = "owm-precipitation";
pub const PRESSURE: &str = "owm-pressure";

fn layer(id: &str, name: &str, layer: &str) -> MapSourceDesc {
    MapSourceDesc {
        id: id.to_owned(),
        name: name.to_owned(),
        license: "Map data is CC-BY-SA 2.0 OpenWeatherMap contributors".to_owned(),
        license_url: "http://creativecommons.org/licenses/by-sa/2.0/".to_owned(),
        zoom_range: const { ZoomRange::known(0, 18) },
        tile_size: 256,
        projection: Projection::Mercator,
        url_template: format!("http://tile.openweathermap.org/map/{layer}/{{z}}/{{x}}/{{y}}.png"),
    }
}

pub fn clouds() -> MapSourceDesc {
    layer(CLOUDS, "OpenWeatherMap cloud layer", "clouds")
}

pub fn wind() -> MapSourceDesc {
    layer(WIND, "OpenWeatherMap wind layer", "wind")
}

pub fn temperature() -> MapSourceDesc {
    layer(TEMPERATURE, "OpenWeatherMap temperature layer", "temp")
}

pub fn precipitation() -> MapSourceDesc {
    layer(
        PRECIPITATION,
        "OpenWeatherMap precipitation layer",
        "precipitation",
    )
}

/// Sea level pressure.
pub fn pressure() -> MapSourceDesc {
    layer(PRESSURE, "OpenWeatherMap sea level pressure layer", "pressure")
}
