diesel::table! {
    dim_stations (id) {
        id -> Int8,
        name -> Text,
        extra -> Jsonb,
    }
}

diesel::table! {
    dim_devices (id) {
        id -> Int8,
        station_id -> Int8,
        name -> Text,
        #[sql_name = "type"]
        type_ -> Text,
        pump_type -> Nullable<Text>,
        rated_power -> Nullable<Numeric>,
        rated_flow -> Nullable<Numeric>,
        rated_head -> Nullable<Numeric>,
    }
}

diesel::table! {
    dim_metric_config (id) {
        id -> Int8,
        metric_key -> Text,
        unit -> Text,
        display_unit -> Nullable<Text>,
        value_type -> Text,
        fixed_decimals -> Nullable<Int2>,
        valid_min -> Nullable<Double>,
        valid_max -> Nullable<Double>,
    }
}

diesel::table! {
    staging_raw (loaded_at) {
        station_name -> Nullable<Text>,
        device_name -> Nullable<Text>,
        metric_key -> Nullable<Text>,
        #[sql_name = "TagName"]
        tag_name -> Nullable<Text>,
        #[sql_name = "DataTime"]
        data_time -> Nullable<Text>,
        #[sql_name = "DataValue"]
        data_value -> Nullable<Text>,
        source_hint -> Nullable<Text>,
        loaded_at -> Timestamptz,
    }
}

diesel::table! {
    staging_rejects (rejected_at) {
        station_name -> Nullable<Text>,
        device_name -> Nullable<Text>,
        metric_key -> Nullable<Text>,
        #[sql_name = "TagName"]
        tag_name -> Nullable<Text>,
        #[sql_name = "DataTime"]
        data_time -> Nullable<Text>,
        #[sql_name = "DataValue"]
        data_value -> Nullable<Text>,
        source_hint -> Nullable<Text>,
        error_msg -> Nullable<Text>,
        rejected_at -> Timestamptz,
    }
}

diesel::table! {
    fact_measurements (station_id, device_id, metric_id, ts_bucket) {
        station_id -> Int8,
        device_id -> Int8,
        metric_id -> Int8,
        ts_raw -> Timestamptz,
        ts_bucket -> Timestamptz,
        value -> Numeric,
        source_hint -> Nullable<Text>,
        inserted_at -> Timestamptz,
    }
}

diesel::joinable!(dim_devices -> dim_stations (station_id));
diesel::allow_tables_to_appear_in_same_query!(dim_stations, dim_devices, dim_metric_config, fact_measurements);
