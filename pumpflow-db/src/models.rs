use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value as Json;

use crate::schema::{dim_devices, dim_metric_config, dim_stations, staging_raw, staging_rejects};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dim_stations)]
pub struct Station {
    pub id: i64,
    pub name: String,
    pub extra: Json,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dim_stations)]
pub struct NewStation<'a> {
    pub name: &'a str,
    pub extra: Json,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dim_devices)]
pub struct Device {
    pub id: i64,
    pub station_id: i64,
    pub name: String,
    #[diesel(column_name = type_)]
    pub device_type: String,
    pub pump_type: Option<String>,
    pub rated_power: Option<bigdecimal::BigDecimal>,
    pub rated_flow: Option<bigdecimal::BigDecimal>,
    pub rated_head: Option<bigdecimal::BigDecimal>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dim_devices)]
pub struct NewDevice<'a> {
    pub station_id: i64,
    pub name: &'a str,
    #[diesel(column_name = type_)]
    pub device_type: &'a str,
    pub pump_type: Option<&'a str>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dim_metric_config)]
pub struct MetricConfig {
    pub id: i64,
    pub metric_key: String,
    pub unit: String,
    pub display_unit: Option<String>,
    pub value_type: String,
    pub fixed_decimals: Option<i16>,
    pub valid_min: Option<f64>,
    pub valid_max: Option<f64>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = staging_raw)]
pub struct NewStagingRow {
    pub station_name: String,
    pub device_name: String,
    pub metric_key: String,
    pub tag_name: String,
    pub data_time: String,
    pub data_value: String,
    pub source_hint: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = staging_rejects)]
pub struct NewStagingReject {
    pub station_name: Option<String>,
    pub device_name: Option<String>,
    pub metric_key: Option<String>,
    pub tag_name: Option<String>,
    pub data_time: Option<String>,
    pub data_value: Option<String>,
    pub source_hint: String,
    pub error_msg: String,
}

#[derive(Debug, Clone, Queryable)]
pub struct StagingRow {
    pub station_name: Option<String>,
    pub device_name: Option<String>,
    pub metric_key: Option<String>,
    pub tag_name: Option<String>,
    pub data_time: Option<String>,
    pub data_value: Option<String>,
    pub source_hint: Option<String>,
    pub loaded_at: DateTime<Utc>,
}
