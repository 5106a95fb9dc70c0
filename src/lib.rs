// NetAgent UPS MQTT bridge
// SPDX-License-Identifier: ISC

//! This Rust crate polls the embedded web interface of NetAgent based
//! UPS cards, extracts telemetry and inventory fields from their HTML
//! pages and republishes everything as retained MQTT messages together
//! with Home Assistant discovery metadata.
//!
//! # Examples
//! ```no_run
//! use netagent2mqtt::{NetAgent, NetAgentError, PollerConfig};
//!
//! /// Print one poll cycle's message batch
//! async fn dump_batch() -> Result<(), NetAgentError> {
//!     let ups = NetAgent::new(PollerConfig::for_ups("192.168.1.2", 80));
//!     for message in ups.poll_batch().await? {
//!         println!("{} = {}", message.topic, message.payload);
//!     }
//!     Ok(())
//! }
//! ```

use html_parser::{Dom, Element, Node};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Label-to-value table extracted from one HTML document.
pub type LabelMap = HashMap<String, String>;

/// Normalized, filtered mapping of telemetry/inventory field keys to
/// typed values. Ordered so repeated runs produce identical batches.
pub type FieldSet = BTreeMap<&'static str, FieldValue>;

#[derive(Debug)]
/// A collection of all possible errors
pub enum NetAgentError {
    Io(std::io::Error),
    HtmlParser(html_parser::Error),
    Json(serde_json::Error),
    MqttClient(rumqttc::ClientError),
    MqttConnection(rumqttc::ConnectionError),
    Timeout,
    InvalidHttpResponse,
}

impl fmt::Display for NetAgentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetAgentError::Io(e) => write!(f, "{}", e),
            NetAgentError::HtmlParser(e) => write!(f, "{}", e),
            NetAgentError::Json(e) => write!(f, "{}", e),
            NetAgentError::MqttClient(e) => write!(f, "{}", e),
            NetAgentError::MqttConnection(e) => write!(f, "{}", e),
            NetAgentError::Timeout => write!(f, "UPS request timed out"),
            NetAgentError::InvalidHttpResponse => write!(f, "invalid HTTP response from UPS"),
        }
    }
}

impl std::error::Error for NetAgentError {}

impl From<std::io::Error> for NetAgentError {
    fn from(e: std::io::Error) -> Self {
        NetAgentError::Io(e)
    }
}

impl From<html_parser::Error> for NetAgentError {
    fn from(e: html_parser::Error) -> Self {
        NetAgentError::HtmlParser(e)
    }
}

impl From<serde_json::Error> for NetAgentError {
    fn from(e: serde_json::Error) -> Self {
        NetAgentError::Json(e)
    }
}

impl From<rumqttc::ClientError> for NetAgentError {
    fn from(e: rumqttc::ClientError) -> Self {
        NetAgentError::MqttClient(e)
    }
}

impl From<rumqttc::ConnectionError> for NetAgentError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        NetAgentError::MqttConnection(e)
    }
}

#[derive(Clone, Debug, PartialEq)]
/// A single normalized field value
pub enum FieldValue {
    /// free-form text (status strings, versions, addresses, ...)
    Text(String),
    /// numeric reading, already rounded to its display precision
    Number(f64),
    /// duration or uptime in whole seconds
    Seconds(u64),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Text(v) => f.write_str(v),
            // integral readings are published without a decimal point
            FieldValue::Number(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => {
                write!(f, "{}", *v as i64)
            }
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Seconds(v) => write!(f, "{}", v),
        }
    }
}

/// Collapse whitespace runs to single spaces and trim. Non-breaking
/// spaces count as whitespace, both in decoded form and as the literal
/// `&nbsp;` entity text that the HTML parser keeps verbatim.
pub fn sanitize_whitespace(text: &str) -> String {
    let text = text.replace("&nbsp;", " ").replace('\u{a0}', " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap());

/// Find the first signed decimal or integer substring and convert it,
/// optionally rounding half-away-from-zero to `precision` digits.
pub fn extract_first_number(text: &str, precision: Option<u32>) -> Option<f64> {
    let number = FIRST_NUMBER.find(text)?.as_str().parse::<f64>().ok()?;

    match precision {
        Some(digits) => {
            let factor = 10f64.powi(digits as i32);
            Some((number * factor).round() / factor)
        }
        None => Some(number),
    }
}

/// Parse a `HH:MM:SS` duration into seconds. The cards render unknown
/// durations as `--:--:--`, which yields `None`.
pub fn parse_duration_seconds(text: &str) -> Option<u64> {
    if text.is_empty() || text.contains("--") {
        return None;
    }

    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours = parts[0].trim().parse::<u64>().ok()?;
    let minutes = parts[1].trim().parse::<u64>().ok()?;
    let seconds = parts[2].trim().parse::<u64>().ok()?;

    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Normalize a `YYYY/MM/DD hh:mm:ss` style timestamp to its dashed ISO
/// like form. Placeholder and blank values yield `None`.
pub fn to_iso_timestamp(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "--" {
        return None;
    }

    Some(trimmed.replace('/', "-"))
}

fn push_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => push_text(&element.children, out),
            _ => {}
        }
    }
}

/// Concatenated text of all descendant text nodes
fn text_content(nodes: &[Node]) -> String {
    let mut out = String::new();
    push_text(nodes, &mut out);
    out
}

fn find_element_by_id<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Element> {
    for node in nodes {
        if let Node::Element(element) = node {
            if element.id.as_deref() == Some(id) {
                return Some(element);
            }
            if let Some(found) = find_element_by_id(&element.children, id) {
                return Some(found);
            }
        }
    }

    None
}

/// Value attribute of the `<input>` with the given name, if present
/// and non-empty. The cards mirror machine-readable readings into
/// hidden inputs named like `$up_time_hidden`.
fn hidden_input_value(nodes: &[Node], name: &str) -> Option<String> {
    for node in nodes {
        if let Node::Element(element) = node {
            if element.name.eq_ignore_ascii_case("input")
                && element.attributes.get("name").map(|v| v.as_deref()) == Some(Some(name))
            {
                let value = element.attributes.get("value").cloned().flatten();
                return value.filter(|v| !v.is_empty());
            }
            if let Some(found) = hidden_input_value(&element.children, name) {
                return Some(found);
            }
        }
    }

    None
}

/// Walk the siblings following a bold label until the next line break
/// and join their display text. Input elements carry no display text
/// and are skipped; their values are consulted separately by name.
fn collect_value_after_label(siblings: &[Node]) -> Option<String> {
    let mut parts = Vec::new();

    for node in siblings {
        match node {
            Node::Element(element) if element.name.eq_ignore_ascii_case("br") => break,
            Node::Element(element) if element.name.eq_ignore_ascii_case("input") => {}
            Node::Element(element) => parts.push(text_content(&element.children)),
            Node::Text(text) => parts.push(text.clone()),
            _ => {}
        }
    }

    let value = sanitize_whitespace(&parts.join(" "));
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn collect_label_entries(nodes: &[Node], labels: &mut LabelMap) {
    for (index, node) in nodes.iter().enumerate() {
        if let Node::Element(element) = node {
            if element.name.eq_ignore_ascii_case("b") {
                let label = sanitize_whitespace(&text_content(&element.children));
                let label = match label.strip_suffix(':') {
                    Some(stripped) => stripped.to_string(),
                    None => label,
                };

                if !label.is_empty() {
                    if let Some(value) = collect_value_after_label(&nodes[index + 1..]) {
                        labels.insert(label, value);
                    }
                }
            }

            collect_label_entries(&element.children, labels);
        }
    }
}

/// Build the label/value table of one page: every `<b>` element's text
/// (trailing colon stripped) maps to the inline text following it up
/// to the next `<br>`. A repeated label's later value wins.
pub fn build_label_map(nodes: &[Node]) -> LabelMap {
    let mut labels = LabelMap::new();
    collect_label_entries(nodes, &mut labels);
    labels
}

fn insert_text(fields: &mut FieldSet, key: &'static str, value: Option<&String>) {
    if let Some(value) = value {
        if !value.trim().is_empty() {
            fields.insert(key, FieldValue::Text(value.clone()));
        }
    }
}

fn insert_number(
    fields: &mut FieldSet,
    key: &'static str,
    value: Option<&String>,
    precision: Option<u32>,
) {
    if let Some(number) = value.and_then(|v| extract_first_number(v, precision)) {
        fields.insert(key, FieldValue::Number(number));
    }
}

fn insert_duration(fields: &mut FieldSet, key: &'static str, value: Option<&String>) {
    if let Some(seconds) = value.and_then(|v| parse_duration_seconds(v)) {
        fields.insert(key, FieldValue::Seconds(seconds));
    }
}

/// Parse the live status page (input/output/battery readings).
pub fn parse_status_page(html: &str) -> Result<FieldSet, NetAgentError> {
    let dom = Dom::parse(html)?;
    let labels = build_label_map(&dom.children);
    let mut fields = FieldSet::new();

    insert_text(&mut fields, "upsStatus", labels.get("UPS Status"));
    insert_text(&mut fields, "acStatus", labels.get("AC Status"));
    insert_number(&mut fields, "inputVoltage", labels.get("Input Line Voltage"), None);
    insert_number(&mut fields, "inputMaxVoltage", labels.get("Input Max. Line Voltage"), None);
    insert_number(&mut fields, "inputMinVoltage", labels.get("Input Min. Line Voltage"), None);
    insert_number(&mut fields, "inputFrequency", labels.get("Input Frequency"), Some(1));
    insert_number(&mut fields, "outputVoltage", labels.get("Output Voltage"), None);
    insert_text(&mut fields, "outputStatus", labels.get("Output Status"));
    // firmware revisions disagree on the capitalization of this label
    insert_number(
        &mut fields,
        "upsLoadPercentage",
        labels.get("UPS Load").or_else(|| labels.get("UPS load")),
        None,
    );
    insert_number(&mut fields, "temperature", labels.get("Temperature"), Some(1));
    insert_text(&mut fields, "batteryStatus", labels.get("Battery Status"));
    insert_number(
        &mut fields,
        "batteryCapacityPercentage",
        labels.get("Battery Capacity"),
        None,
    );
    insert_number(&mut fields, "batteryVoltage", labels.get("Battery Voltage"), Some(2));
    insert_duration(&mut fields, "timeOnBatterySeconds", labels.get("Time on Battery"));
    insert_duration(
        &mut fields,
        "estimatedTimeRemainingSeconds",
        labels.get("Estimated Battery Remaining Time"),
    );
    insert_text(&mut fields, "upsLastSelfTest", labels.get("UPS Last Self Test"));
    insert_text(&mut fields, "upsNextSelfTest", labels.get("UPS Next Self Test"));

    Ok(fields)
}

/// Parse the system status page (firmware, network and clock fields).
pub fn parse_system_page(html: &str) -> Result<FieldSet, NetAgentError> {
    let dom = Dom::parse(html)?;
    let labels = build_label_map(&dom.children);
    let mut fields = FieldSet::new();

    insert_text(&mut fields, "hardwareVersion", labels.get("Hardware Version"));
    insert_text(&mut fields, "systemFirmwareVersion", labels.get("Firmware Version"));
    insert_text(&mut fields, "serialNumber", labels.get("Serial Number"));
    insert_text(&mut fields, "systemName", labels.get("System Name"));
    insert_text(&mut fields, "location", labels.get("Location"));

    // the displayed clock wins over the hidden field, which wins over
    // the plain label
    let time_display = find_element_by_id(&dom.children, "sys_time")
        .map(|element| sanitize_whitespace(&text_content(&element.children)))
        .filter(|text| !text.is_empty());
    let system_time = time_display
        .or_else(|| hidden_input_value(&dom.children, "$year_date_time"))
        .or_else(|| labels.get("System Time").cloned())
        .and_then(|text| to_iso_timestamp(&text));
    if let Some(timestamp) = system_time {
        fields.insert("systemTime", FieldValue::Text(timestamp));
    }

    let uptime = match hidden_input_value(&dom.children, "$up_time_hidden") {
        Some(raw) => raw.trim().parse::<u64>().ok(),
        None => labels.get("Uptime").and_then(|v| parse_duration_seconds(v)),
    };
    if let Some(seconds) = uptime {
        fields.insert("uptimeSeconds", FieldValue::Seconds(seconds));
    }

    insert_text(&mut fields, "upsLastSelfTest", labels.get("UPS Last Self Test"));
    insert_text(&mut fields, "upsNextSelfTest", labels.get("UPS Next Self Test"));
    insert_text(&mut fields, "macAddress", labels.get("MAC Address"));
    insert_text(&mut fields, "ipAddress", labels.get("IP Address"));
    insert_text(&mut fields, "emailServer", labels.get("Email Server"));
    insert_text(&mut fields, "primaryDns", labels.get("Primary DNS Server"));
    insert_text(&mut fields, "secondaryDns", labels.get("Secondary DNS Server"));
    insert_text(&mut fields, "pppoeIp", labels.get("PPPoE IP"));

    Ok(fields)
}

/// Parse the UPS inventory page (manufacturer, model, battery data).
pub fn parse_info_page(html: &str) -> Result<FieldSet, NetAgentError> {
    let dom = Dom::parse(html)?;
    let labels = build_label_map(&dom.children);
    let mut fields = FieldSet::new();

    insert_text(&mut fields, "upsManufacturer", labels.get("UPS Manufacturer"));
    insert_text(&mut fields, "upsFirmwareVersion", labels.get("UPS Firmware Version"));
    insert_text(&mut fields, "upsModel", labels.get("UPS Model"));
    insert_text(
        &mut fields,
        "batteryReplacementDate",
        labels.get("Date of last battery replacement"),
    );
    insert_number(&mut fields, "batteryCount", labels.get("Number of Batteries"), None);
    insert_number(
        &mut fields,
        "batteryChargeVoltage",
        labels.get("Battery Charge Voltage"),
        None,
    );
    insert_number(
        &mut fields,
        "batteryVoltageRating",
        labels.get("Battery Voltage Rating"),
        None,
    );

    Ok(fields)
}

/// Merge the three page field sets. Status readings override system
/// fields, which override inventory fields. `ipAddress` falls back to
/// the configured UPS address when no page reported one.
pub fn combine_field_sets(
    info: FieldSet,
    system: FieldSet,
    status: FieldSet,
    configured_address: &str,
) -> FieldSet {
    let mut merged = info;
    merged.extend(system);
    merged.extend(status);

    merged
        .entry("ipAddress")
        .or_insert_with(|| FieldValue::Text(configured_address.to_string()));

    merged
}

/// Drop readings this card family is known to misreport: battery
/// voltage below 10 V and battery capacity below 5 %.
pub fn remove_glitch_readings(fields: &mut FieldSet) {
    if let Some(voltage) = fields.get("batteryVoltage").and_then(FieldValue::as_number) {
        if voltage < 10.0 {
            debug!(voltage, "dropping implausible battery voltage reading");
            fields.remove("batteryVoltage");
        }
    }

    if let Some(capacity) = fields
        .get("batteryCapacityPercentage")
        .and_then(FieldValue::as_number)
    {
        if capacity < 5.0 {
            debug!(capacity, "dropping implausible battery capacity reading");
            fields.remove("batteryCapacityPercentage");
        }
    }
}

/// Presentation metadata for one published field
#[derive(Clone, Copy, Debug)]
pub struct SensorDefinition {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub entity_category: Option<&'static str>,
    pub icon: Option<&'static str>,
    pub suggested_precision: Option<u32>,
    pub topic_suffix: &'static str,
}

const SENSOR: SensorDefinition = SensorDefinition {
    key: "",
    name: "",
    unit: None,
    device_class: None,
    state_class: None,
    entity_category: None,
    icon: None,
    suggested_precision: None,
    topic_suffix: "",
};

/// Fields without an entry here are parsed but never published.
pub const SENSOR_DEFINITIONS: &[SensorDefinition] = &[
    SensorDefinition { key: "upsStatus", name: "UPS Status", icon: Some("mdi:power-plug-battery"), topic_suffix: "status/general/ups_status", ..SENSOR },
    SensorDefinition { key: "acStatus", name: "AC Status", icon: Some("mdi:connection"), topic_suffix: "status/general/ac_status", ..SENSOR },
    SensorDefinition { key: "inputVoltage", name: "Input Voltage", unit: Some("V"), device_class: Some("voltage"), state_class: Some("measurement"), topic_suffix: "status/input/line_voltage", ..SENSOR },
    SensorDefinition { key: "inputMaxVoltage", name: "Input Max Voltage", unit: Some("V"), device_class: Some("voltage"), state_class: Some("measurement"), entity_category: Some("diagnostic"), topic_suffix: "status/input/max_voltage", ..SENSOR },
    SensorDefinition { key: "inputMinVoltage", name: "Input Min Voltage", unit: Some("V"), device_class: Some("voltage"), state_class: Some("measurement"), entity_category: Some("diagnostic"), topic_suffix: "status/input/min_voltage", ..SENSOR },
    SensorDefinition { key: "inputFrequency", name: "Input Frequency", unit: Some("Hz"), device_class: Some("frequency"), state_class: Some("measurement"), suggested_precision: Some(1), topic_suffix: "status/input/frequency", ..SENSOR },
    SensorDefinition { key: "outputVoltage", name: "Output Voltage", unit: Some("V"), device_class: Some("voltage"), state_class: Some("measurement"), entity_category: Some("diagnostic"), topic_suffix: "status/output/voltage", ..SENSOR },
    SensorDefinition { key: "outputStatus", name: "Output Status", entity_category: Some("diagnostic"), topic_suffix: "status/output/status", ..SENSOR },
    SensorDefinition { key: "upsLoadPercentage", name: "UPS Load", unit: Some("%"), state_class: Some("measurement"), icon: Some("mdi:gauge"), entity_category: Some("diagnostic"), topic_suffix: "status/output/load_percentage", ..SENSOR },
    SensorDefinition { key: "temperature", name: "Temperature", unit: Some("°C"), device_class: Some("temperature"), state_class: Some("measurement"), entity_category: Some("diagnostic"), topic_suffix: "status/battery/temperature", ..SENSOR },
    SensorDefinition { key: "batteryStatus", name: "Battery Status", entity_category: Some("diagnostic"), topic_suffix: "status/battery/status", ..SENSOR },
    SensorDefinition { key: "batteryCapacityPercentage", name: "Battery Capacity", unit: Some("%"), device_class: Some("battery"), state_class: Some("measurement"), icon: Some("mdi:battery"), topic_suffix: "status/battery/capacity_percentage", ..SENSOR },
    SensorDefinition { key: "batteryVoltage", name: "Battery Voltage", unit: Some("V"), device_class: Some("voltage"), state_class: Some("measurement"), suggested_precision: Some(2), topic_suffix: "status/battery/voltage", ..SENSOR },
    SensorDefinition { key: "timeOnBatterySeconds", name: "Time on Battery", unit: Some("s"), device_class: Some("duration"), state_class: Some("total_increasing"), entity_category: Some("diagnostic"), topic_suffix: "status/battery/time_on_battery_seconds", ..SENSOR },
    SensorDefinition { key: "estimatedTimeRemainingSeconds", name: "Estimated Time Remaining", unit: Some("s"), device_class: Some("duration"), entity_category: Some("diagnostic"), topic_suffix: "status/battery/estimated_time_remaining_seconds", ..SENSOR },
    SensorDefinition { key: "hardwareVersion", name: "Hardware Version", entity_category: Some("diagnostic"), topic_suffix: "system/info/hardware_version", ..SENSOR },
    SensorDefinition { key: "systemFirmwareVersion", name: "System Firmware Version", entity_category: Some("diagnostic"), topic_suffix: "system/info/system_firmware_version", ..SENSOR },
    SensorDefinition { key: "serialNumber", name: "Serial Number", entity_category: Some("diagnostic"), topic_suffix: "system/info/serial_number", ..SENSOR },
    SensorDefinition { key: "systemName", name: "System Name", entity_category: Some("diagnostic"), topic_suffix: "system/info/system_name", ..SENSOR },
    SensorDefinition { key: "location", name: "Location", entity_category: Some("diagnostic"), topic_suffix: "system/info/location", ..SENSOR },
    SensorDefinition { key: "systemTime", name: "System Time", entity_category: Some("diagnostic"), topic_suffix: "system/info/system_time", ..SENSOR },
    SensorDefinition { key: "uptimeSeconds", name: "UPS Uptime", unit: Some("s"), device_class: Some("duration"), state_class: Some("total_increasing"), entity_category: Some("diagnostic"), topic_suffix: "system/info/uptime_seconds", ..SENSOR },
    SensorDefinition { key: "upsLastSelfTest", name: "UPS Last Self Test", entity_category: Some("diagnostic"), topic_suffix: "status/self_test/last", ..SENSOR },
    SensorDefinition { key: "upsNextSelfTest", name: "UPS Next Self Test", entity_category: Some("diagnostic"), topic_suffix: "status/self_test/next", ..SENSOR },
    SensorDefinition { key: "macAddress", name: "MAC Address", entity_category: Some("diagnostic"), topic_suffix: "system/network/mac", ..SENSOR },
    SensorDefinition { key: "ipAddress", name: "IP Address", entity_category: Some("diagnostic"), topic_suffix: "system/network/ip", ..SENSOR },
    SensorDefinition { key: "emailServer", name: "Email Server", entity_category: Some("diagnostic"), topic_suffix: "system/network/email_server", ..SENSOR },
    SensorDefinition { key: "primaryDns", name: "Primary DNS", entity_category: Some("diagnostic"), topic_suffix: "system/network/primary_dns", ..SENSOR },
    SensorDefinition { key: "secondaryDns", name: "Secondary DNS", entity_category: Some("diagnostic"), topic_suffix: "system/network/secondary_dns", ..SENSOR },
    SensorDefinition { key: "pppoeIp", name: "PPPoE IP", entity_category: Some("diagnostic"), topic_suffix: "system/network/pppoe_ip", ..SENSOR },
    SensorDefinition { key: "upsManufacturer", name: "UPS Manufacturer", entity_category: Some("diagnostic"), topic_suffix: "device/info/manufacturer", ..SENSOR },
    SensorDefinition { key: "upsFirmwareVersion", name: "UPS Firmware Version", entity_category: Some("diagnostic"), topic_suffix: "device/info/ups_firmware_version", ..SENSOR },
    SensorDefinition { key: "upsModel", name: "UPS Model", entity_category: Some("diagnostic"), topic_suffix: "device/info/model", ..SENSOR },
    SensorDefinition { key: "batteryReplacementDate", name: "Battery Replacement Date", entity_category: Some("diagnostic"), topic_suffix: "device/battery/replacement_date", ..SENSOR },
    SensorDefinition { key: "batteryCount", name: "Battery Count", unit: Some("pcs"), entity_category: Some("diagnostic"), topic_suffix: "device/battery/count", ..SENSOR },
    // SensorDefinition { key: "batteryChargeVoltage", name: "Battery Charge Voltage", unit: Some("V"), device_class: Some("voltage"), entity_category: Some("diagnostic"), suggested_precision: Some(2), topic_suffix: "device/battery/charge_voltage", ..SENSOR },
    SensorDefinition { key: "batteryVoltageRating", name: "Battery Voltage Rating", unit: Some("V"), device_class: Some("voltage"), entity_category: Some("diagnostic"), topic_suffix: "device/battery/voltage_rating", ..SENSOR },
];

pub fn sensor_definition(key: &str) -> Option<&'static SensorDefinition> {
    SENSOR_DEFINITIONS.iter().find(|definition| definition.key == key)
}

/// Resolved configuration for one poller instance, built once at
/// startup and passed explicitly into the parsers and builders.
#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub status_path: String,
    pub system_path: String,
    pub info_path: String,
    pub topic_root: String,
    pub discovery_prefix: String,
    pub device_id: String,
    pub device_name: Option<String>,
    pub configuration_url: String,
}

impl PollerConfig {
    /// Configuration with the stock NetAgent page paths and topic
    /// layout for the given UPS address.
    pub fn for_ups(host: &str, port: u16) -> Self {
        let topic_root = "ups-netagent".to_string();
        PollerConfig {
            host: host.to_string(),
            port,
            timeout: Duration::from_millis(5000),
            status_path: "/pda/status-1.htm".to_string(),
            system_path: "/pda/sys_status.htm".to_string(),
            info_path: "/pda/UPS.htm".to_string(),
            discovery_prefix: format!("homeassistant/sensor/{}", topic_root),
            topic_root,
            device_id: "ups_netagent".to_string(),
            device_name: None,
            configuration_url: derive_configuration_url(host, port),
        }
    }
}

/// Default configuration URL for the discovery device record. The
/// port is omitted when it is plain HTTP on 80.
pub fn derive_configuration_url(host: &str, port: u16) -> String {
    if port == 80 {
        format!("http://{}", host)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Device record shared by all discovery messages
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub configuration_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<(String, String)>>,
}

/// Build the discovery device record from the merged field set.
pub fn build_device_info(fields: &FieldSet, config: &PollerConfig) -> DeviceInfo {
    let text = |key: &str| {
        fields
            .get(key)
            .and_then(FieldValue::as_text)
            .map(str::to_string)
    };

    DeviceInfo {
        identifiers: vec![config.device_id.clone()],
        name: config.device_name.clone().or_else(|| text("systemName")),
        configuration_url: config.configuration_url.clone(),
        manufacturer: text("upsManufacturer"),
        model: text("upsModel"),
        sw_version: text("upsFirmwareVersion").or_else(|| text("systemFirmwareVersion")),
        hw_version: text("hardwareVersion"),
        serial_number: text("serialNumber"),
        suggested_area: text("location"),
        connections: text("macAddress").map(|mac| vec![("mac".to_string(), mac.to_lowercase())]),
    }
}

/// One MQTT message, built fresh each poll cycle
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Serialize)]
struct DiscoveryConfig<'a> {
    name: &'static str,
    state_topic: String,
    unique_id: String,
    device: &'a DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_category: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggested_display_precision: Option<u32>,
}

fn state_topic(definition: &SensorDefinition, config: &PollerConfig) -> String {
    format!("{}/{}", config.topic_root, definition.topic_suffix)
}

/// One retained state message per field with a sensor definition.
pub fn build_state_messages(fields: &FieldSet, config: &PollerConfig) -> Vec<OutboundMessage> {
    fields
        .iter()
        .filter_map(|(key, value)| {
            sensor_definition(key).map(|definition| OutboundMessage {
                topic: state_topic(definition, config),
                payload: value.to_string(),
                retain: true,
            })
        })
        .collect()
}

/// One retained discovery config message per field with a sensor
/// definition, pointing Home Assistant at the state topic.
pub fn build_discovery_messages(
    fields: &FieldSet,
    device: &DeviceInfo,
    config: &PollerConfig,
) -> Result<Vec<OutboundMessage>, NetAgentError> {
    let mut messages = Vec::new();

    for key in fields.keys() {
        let definition = match sensor_definition(key) {
            Some(definition) => definition,
            None => continue,
        };

        let payload = DiscoveryConfig {
            name: definition.name,
            state_topic: state_topic(definition, config),
            unique_id: format!("{}_{}", config.device_id, key),
            device,
            unit_of_measurement: definition.unit,
            device_class: definition.device_class,
            state_class: definition.state_class,
            entity_category: definition.entity_category,
            icon: definition.icon,
            suggested_display_precision: definition.suggested_precision,
        };

        messages.push(OutboundMessage {
            topic: format!("{}/{}/config", config.discovery_prefix, key),
            payload: serde_json::to_string(&payload)?,
            retain: true,
        });
    }

    Ok(messages)
}

/// Full batch for one cycle: all state messages, then all discovery
/// messages.
pub fn build_publish_batch(
    fields: &FieldSet,
    device: &DeviceInfo,
    config: &PollerConfig,
) -> Result<Vec<OutboundMessage>, NetAgentError> {
    let mut messages = build_state_messages(fields, config);
    messages.extend(build_discovery_messages(fields, device, config)?);
    Ok(messages)
}

/// Poll client for one NetAgent based UPS web card
pub struct NetAgent {
    config: PollerConfig,
}

impl NetAgent {
    pub fn new(config: PollerConfig) -> Self {
        NetAgent { config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Fetch one page body. The cards answer with pre-HTTP/1.1 framing
    /// and unreliable status lines, so this is a bare GET over TCP:
    /// everything after the first blank line is the body, the status
    /// code is not inspected.
    async fn fetch_page(&self, path: &str) -> Result<String, NetAgentError> {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, self.config.host
        );

        let exchange = async {
            let mut stream =
                TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
            stream.write_all(request.as_bytes()).await?;

            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await?;
            Ok::<_, NetAgentError>(raw)
        };

        let raw = match tokio::time::timeout(self.config.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(NetAgentError::Timeout),
        };

        // the cards emit Latin-1ish bytes, decode lossily
        let response = String::from_utf8_lossy(&raw);
        match response.find("\r\n\r\n") {
            Some(separator) => Ok(response[separator + 4..].to_string()),
            None => Err(NetAgentError::InvalidHttpResponse),
        }
    }

    /// Run one poll cycle up to (but not including) the publish: fetch
    /// the three pages concurrently, parse, merge, glitch-filter and
    /// build the message batch. Any fetch failure fails the cycle.
    pub async fn poll_batch(&self) -> Result<Vec<OutboundMessage>, NetAgentError> {
        let (status_html, system_html, info_html) = tokio::try_join!(
            self.fetch_page(&self.config.status_path),
            self.fetch_page(&self.config.system_path),
            self.fetch_page(&self.config.info_path),
        )?;

        let status = parse_status_page(&status_html)?;
        let system = parse_system_page(&system_html)?;
        let info = parse_info_page(&info_html)?;

        let mut merged = combine_field_sets(info, system, status, &self.config.host);
        let device = build_device_info(&merged, &self.config);
        remove_glitch_readings(&mut merged);
        debug!(fields = merged.len(), "parsed UPS pages");

        build_publish_batch(&merged, &device, &self.config)
    }
}

/// Publish a batch over a fresh broker connection: every message at
/// QoS 1 with its retain flag, waiting for all acknowledgements before
/// disconnecting. The first error aborts the batch.
pub async fn publish_messages(
    broker_host: &str,
    broker_port: u16,
    client_id: &str,
    messages: &[OutboundMessage],
) -> Result<(), NetAgentError> {
    use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};

    if messages.is_empty() {
        return Ok(());
    }

    let mut options = MqttOptions::new(client_id, broker_host, broker_port);
    options.set_keep_alive(Duration::from_secs(30));

    // all publishes are queued before the event loop runs, so the
    // request channel must hold the whole batch
    let (client, mut eventloop) = AsyncClient::new(options, messages.len() + 4);

    for message in messages {
        client
            .publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                message.retain,
                message.payload.clone(),
            )
            .await?;
    }

    let mut unacked = messages.len();
    while unacked > 0 {
        if let Event::Incoming(Packet::PubAck(_)) = eventloop.poll().await? {
            unacked -= 1;
        }
    }

    client.disconnect().await?;
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => continue,
            // broker closed the connection after our disconnect
            Err(_) => break,
        }
    }

    Ok(())
}
