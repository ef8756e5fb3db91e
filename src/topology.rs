// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

//! Controller object graph: reads on a [`Session`] and the sequential walk
//! that hands each addressed device to a [`DeviceWiring`].

use std::future::Future;

use tracing::{debug, error, info, warn};

use crate::error::{LeapError, Result};
use crate::protocol::{
    self, AreaDefinition, ButtonDefinition, ButtonGroupDefinition, ControlStationDefinition,
    DeviceDefinition, MultipleAreaDefinition, MultipleButtonGroupDefinition,
    MultipleControlStationDefinition, OneButtonDefinition, OneDeviceDefinition,
    OneProjectDefinition, ProjectDefinition,
};
use crate::session::Session;

/// Controller product lines the walker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    RadioRa3,
    HomeWorksQsx,
}

impl ProjectType {
    pub fn from_product_type(product_type: &str) -> Option<Self> {
        match product_type {
            "Lutron RadioRA 3 Project" => Some(Self::RadioRa3),
            "Lutron HWQS Project" => Some(Self::HomeWorksQsx),
            _ => None,
        }
    }
}

/// Identity of the controller itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorInfo {
    pub firmware_revision: String,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
    pub serial_number: String,
}

const MANUFACTURER: &str = "Lutron Electronics Co., Inc";

impl Session {
    pub async fn processor_info(&self) -> Result<ProcessorInfo> {
        debug!("Getting processor information");
        let device = self
            .read_body::<OneDeviceDefinition>(protocol::PROCESSOR_INFO_URL)
            .await
            .map_err(|e| LeapError::topology(protocol::PROCESSOR_INFO_URL, &e))?
            .device;
        Ok(ProcessorInfo {
            firmware_revision: device
                .firmware_image
                .map(|f| f.firmware.display_name)
                .unwrap_or_default(),
            manufacturer: MANUFACTURER.to_string(),
            model: device.model_number.unwrap_or_default(),
            name: device.name,
            serial_number: device.serial_number.unwrap_or_default(),
        })
    }

    pub async fn project(&self) -> Result<ProjectDefinition> {
        self.read_body::<OneProjectDefinition>(protocol::PROJECT_URL)
            .await
            .map(|b| b.project)
            .map_err(|e| LeapError::topology(protocol::PROJECT_URL, &e))
    }

    pub async fn areas(&self) -> Result<Vec<AreaDefinition>> {
        debug!("Getting areas");
        self.read_body::<MultipleAreaDefinition>(protocol::AREA_URL)
            .await
            .map(|b| b.areas)
            .map_err(|e| LeapError::topology(protocol::AREA_URL, &e))
    }

    /// Control stations in an area. An area with none may answer `204 No Content`.
    pub async fn area_control_stations(
        &self,
        area: &AreaDefinition,
    ) -> Result<Vec<ControlStationDefinition>> {
        debug!("Getting control stations for area {}", area.href);
        let url = protocol::control_stations_url(&area.href);
        let read = async {
            let resp = self.read(&url).await?;
            if resp.body.is_none() && resp.header.status_code.as_ref().is_some_and(|s| s.code == 204) {
                return Ok(Vec::new());
            }
            resp.body_as::<MultipleControlStationDefinition>()
                .map(|b| b.control_stations)
        };
        read.await.map_err(|e| LeapError::topology(&url, &e))
    }

    pub async fn device(&self, href: &str) -> Result<DeviceDefinition> {
        debug!("Getting device {}", href);
        self.read_body::<OneDeviceDefinition>(href)
            .await
            .map(|b| b.device)
            .map_err(|e| LeapError::topology(href, &e))
    }

    pub async fn device_button_groups(
        &self,
        device: &DeviceDefinition,
    ) -> Result<Vec<ButtonGroupDefinition>> {
        debug!("Getting button groups for device {}", device.href);
        let url = protocol::button_groups_url(&device.href);
        self.read_body::<MultipleButtonGroupDefinition>(&url)
            .await
            .map(|b| b.button_groups)
            .map_err(|e| LeapError::topology(&url, &e))
    }

    /// Read every button in a group, in group order.
    pub async fn buttons_from_group(
        &self,
        group: &ButtonGroupDefinition,
    ) -> Result<Vec<ButtonDefinition>> {
        let mut buttons = Vec::with_capacity(group.buttons.len());
        for href in &group.buttons {
            let button = self
                .read_body::<OneButtonDefinition>(&href.href)
                .await
                .map_err(|e| LeapError::topology(&href.href, &e))?
                .button;
            buttons.push(button);
        }
        Ok(buttons)
    }
}

/// Outcome of wiring one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireResult {
    Success { name: String },
    Skipped { reason: String },
    Error { reason: String },
}

/// Turns an addressed device into whatever the bridge exposes for it.
pub trait DeviceWiring: Send + Sync {
    fn wire(
        &self,
        session: &Session,
        area: &AreaDefinition,
        station: &ControlStationDefinition,
        device: &DeviceDefinition,
    ) -> impl Future<Output = WireResult> + Send;
}

/// Tally of one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub wired: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    /// Reads that failed and cut off a branch of the walk.
    pub read_errors: usize,
}

/// Walk project → leaf areas → control stations → ganged devices, one at a
/// time, handing each addressed device to `wiring`.
///
/// Only an unreadable or unsupported project aborts the walk; any other
/// failed read drops that branch and carries on with its siblings.
pub async fn walk<W: DeviceWiring>(session: &Session, wiring: &W) -> Result<WalkReport> {
    let id = session.controller_id();
    let project = session.project().await?;
    if ProjectType::from_product_type(&project.product_type).is_none() {
        error!(
            "Controller {} has unsupported project type {}",
            id, project.product_type
        );
        return Err(LeapError::UnsupportedProjectType {
            product_type: project.product_type,
        });
    }
    info!("Walking {} on controller {}", project.product_type, id);

    let mut report = WalkReport::default();
    let areas = match session.areas().await {
        Ok(areas) => areas,
        Err(e) => {
            error!("Controller {}: {}", id, e);
            report.read_errors += 1;
            return Ok(report);
        }
    };

    for area in areas.iter().filter(|a| a.is_leaf) {
        let stations = match session.area_control_stations(area).await {
            Ok(stations) => stations,
            Err(e) => {
                warn!("Controller {}: skipping area {}: {}", id, area.name, e);
                report.read_errors += 1;
                continue;
            }
        };

        for station in &stations {
            let Some(ganged) = station.associated_ganged_devices.as_deref() else {
                continue;
            };
            for gang in ganged {
                let device = match session.device(&gang.device.href).await {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("Controller {}: skipping device in {}: {}", id, station.name, e);
                        report.read_errors += 1;
                        continue;
                    }
                };
                if !device.is_addressed() {
                    debug!("Skipping unaddressed device {} {}", area.name, device.name);
                    continue;
                }

                let label = format!("{} {}", area.name, device.name);
                match wiring.wire(session, area, station, &device).await {
                    WireResult::Success { name } => {
                        info!("Wired {} ({})", name, device.device_type);
                        report.wired.push(name);
                    }
                    WireResult::Skipped { reason } => {
                        info!("Skipped {}: {}", label, reason);
                        report.skipped.push(label);
                    }
                    WireResult::Error { reason } => {
                        error!("Failed to wire {}: {}", label, reason);
                        report.failed.push(label);
                    }
                }
            }
        }
    }

    info!(
        "Controller {}: {} wired, {} skipped, {} failed, {} read errors",
        id,
        report.wired.len(),
        report.skipped.len(),
        report.failed.len(),
        report.read_errors
    );
    Ok(report)
}
