//! Output resource discovery.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kms::{ConnectorInfo, DisplayMode, KmsDevice, PlaneInfo, PlaneKind};

/// Resources selected for scanout.
#[derive(Copy, Clone, Debug)]
pub struct Discovery<M> {
    pub connector: u32,
    pub crtc: u32,
    /// Index of the CRTC in the device's resource list.
    pub crtc_index: u32,
    /// Plane usable with the CRTC, if any.
    pub plane: Option<PlaneInfo>,
    pub mode: DisplayMode<M>,
}

/// Find the first connected output and everything required to drive it.
pub fn discover<D: KmsDevice>(device: &D, prefer_overlay: bool) -> Result<Discovery<D::Mode>> {
    let connectors = device.connectors()?;
    let connector = connectors
        .into_iter()
        .find(|connector| connector.connected && !connector.modes.is_empty())
        .ok_or(Error::NoConnector)?;

    let mode = select_mode(&connector).ok_or(Error::NoConnector)?;

    let crtcs = device.crtcs()?;
    let crtc = find_crtc(device, &connector, &crtcs).ok_or(Error::NoCrtc(connector.id))?;
    let crtc_index = crtcs.iter().position(|id| *id == crtc).ok_or(Error::NoCrtc(connector.id))?;
    let crtc_index = crtc_index as u32;

    let planes = match device.planes() {
        Ok(planes) => planes,
        Err(err) => {
            warn!("plane enumeration failed: {err}");
            Vec::new()
        },
    };
    let plane = select_plane(&planes, crtc_index, prefer_overlay);
    match &plane {
        Some(plane) => debug!("selected {:?} plane {}", plane.kind, plane.id),
        None => warn!("no usable plane for CRTC {crtc}, using mode-sets only"),
    }

    info!(
        "discovered connector {} on CRTC {crtc} with {}x{}@{}",
        connector.id, mode.width, mode.height, mode.refresh
    );

    Ok(Discovery { connector: connector.id, crtc, crtc_index, plane, mode })
}

/// Preferred mode, or the first mode if none is preferred.
fn select_mode<M: Copy>(connector: &ConnectorInfo<M>) -> Option<DisplayMode<M>> {
    connector.modes.iter().find(|mode| mode.preferred).or_else(|| connector.modes.first()).copied()
}

/// Resolve the CRTC for a connector.
///
/// The current encoder's CRTC is used when it has one, otherwise the first
/// CRTC compatible with any of the connector's encoders.
fn find_crtc<D: KmsDevice>(
    device: &D,
    connector: &ConnectorInfo<D::Mode>,
    crtcs: &[u32],
) -> Option<u32> {
    let current = connector.current_encoder.and_then(|id| device.encoder(id).ok());
    if let Some(crtc) = current.and_then(|encoder| encoder.crtc) {
        return Some(crtc);
    }

    connector.encoders.iter().filter_map(|id| device.encoder(*id).ok()).find_map(|encoder| {
        crtcs
            .iter()
            .enumerate()
            .find(|(index, _)| encoder.possible_crtcs & index_bit(*index as u32) != 0)
            .map(|(_, crtc)| *crtc)
    })
}

/// Pick a primary or overlay plane for the CRTC at `crtc_index`.
fn select_plane(planes: &[PlaneInfo], crtc_index: u32, prefer_overlay: bool) -> Option<PlaneInfo> {
    let (preferred, fallback) = if prefer_overlay {
        (PlaneKind::Overlay, PlaneKind::Primary)
    } else {
        (PlaneKind::Primary, PlaneKind::Overlay)
    };

    let compatible = |kind: PlaneKind| {
        planes
            .iter()
            .find(|plane| plane.kind == kind && plane.possible_crtcs & index_bit(crtc_index) != 0)
            .copied()
    };

    compatible(preferred).or_else(|| compatible(fallback))
}

/// Bit of a CRTC index in a possible-CRTC mask.
fn index_bit(index: u32) -> u32 {
    1u32.checked_shl(index).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kms::mock::{self, MockDevice};
    use crate::kms::EncoderInfo;

    fn mode(width: u32, preferred: bool) -> DisplayMode<()> {
        DisplayMode { width, height: 480, refresh: 60, preferred, descriptor: () }
    }

    #[test]
    fn default_topology() {
        let device = MockDevice::new();
        let discovery = discover(&device, false).unwrap();

        assert_eq!(discovery.connector, mock::CONNECTOR);
        assert_eq!(discovery.crtc, mock::CRTC);
        assert_eq!(discovery.crtc_index, 0);
        assert_eq!(discovery.plane.map(|plane| plane.id), Some(mock::PRIMARY_PLANE));
        assert_eq!((discovery.mode.width, discovery.mode.height), (1280, 720));

        let discovery = discover(&device, true).unwrap();
        assert_eq!(discovery.plane.map(|plane| plane.id), Some(mock::OVERLAY_PLANE));
    }

    #[test]
    fn skips_disconnected() {
        let device = MockDevice::new();
        device.script(|state| {
            let mut disconnected = state.connectors[0].clone();
            disconnected.id = 99;
            disconnected.connected = false;

            let mut modeless = state.connectors[0].clone();
            modeless.id = 98;
            modeless.modes.clear();

            state.connectors.insert(0, modeless);
            state.connectors.insert(0, disconnected);
        });

        assert_eq!(discover(&device, false).unwrap().connector, mock::CONNECTOR);
    }

    #[test]
    fn no_connector() {
        let device = MockDevice::new();
        device.script(|state| state.connectors[0].connected = false);

        assert!(matches!(discover(&device, false), Err(Error::NoConnector)));
    }

    #[test]
    fn mode_selection() {
        let mut connector = ConnectorInfo {
            id: 1,
            connected: true,
            modes: vec![mode(640, false), mode(800, true)],
            current_encoder: None,
            encoders: Vec::new(),
        };
        assert_eq!(select_mode(&connector).map(|mode| mode.width), Some(800));

        connector.modes[1].preferred = false;
        assert_eq!(select_mode(&connector).map(|mode| mode.width), Some(640));
    }

    #[test]
    fn crtc_from_possible_mask() {
        let device = MockDevice::new();
        device.script(|state| {
            state.connectors[0].current_encoder = None;
            state.encoders = vec![EncoderInfo { id: mock::ENCODER, crtc: None, possible_crtcs: 0b10 }];
            for plane in &mut state.planes {
                plane.possible_crtcs = 0b10;
            }
        });

        let discovery = discover(&device, false).unwrap();
        assert_eq!(discovery.crtc, mock::CRTC + 1);
        assert_eq!(discovery.crtc_index, 1);
        assert_eq!(discovery.plane.map(|plane| plane.id), Some(mock::PRIMARY_PLANE));
    }

    #[test]
    fn no_crtc() {
        let device = MockDevice::new();
        device.script(|state| {
            state.connectors[0].current_encoder = None;
            state.encoders[0].possible_crtcs = 0;
        });

        assert!(matches!(discover(&device, false), Err(Error::NoCrtc(mock::CONNECTOR))));
    }

    #[test]
    fn plane_fallbacks() {
        let plane = |id, kind, possible_crtcs| PlaneInfo { id, kind, possible_crtcs };

        let planes = [plane(1, PlaneKind::Overlay, 0b1), plane(2, PlaneKind::Cursor, 0b1)];
        assert_eq!(select_plane(&planes, 0, false).map(|plane| plane.id), Some(1));

        let planes = [plane(1, PlaneKind::Primary, 0b1)];
        assert_eq!(select_plane(&planes, 0, true).map(|plane| plane.id), Some(1));

        let planes = [plane(1, PlaneKind::Primary, 0b10), plane(2, PlaneKind::Cursor, 0b1)];
        assert!(select_plane(&planes, 0, false).is_none());
    }
}
