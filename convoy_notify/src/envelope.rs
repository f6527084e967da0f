use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const GUID_NULL: &str = "00000000-0000-0000-0000-000000000000";

const ENVELOPE_NAME: &str = "Microsoft.ApplicationInsights.OpenSchema";
const BASE_TYPE: &str = "OpenSchemaData";
const BASE_DATA_VERSION: &str = "2";

/// The JSON document posted for every committed blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub data: EnvelopeData,
    pub ver: u32,
    pub name: String,
    pub time: String,
    #[serde(rename = "iKey")]
    pub ikey: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    pub base_type: String,
    pub base_data: BaseData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseData {
    pub ver: String,
    pub blob_sas_uri: String,
    pub source_name: String,
    pub source_version: String,
}

impl NotificationEnvelope {
    pub fn new(
        instrumentation_key: impl Into<String>,
        schema_id: impl Into<String>,
        blob_sas_uri: impl Into<String>,
        version: u32,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            data: EnvelopeData {
                base_type: BASE_TYPE.to_string(),
                base_data: BaseData {
                    ver: BASE_DATA_VERSION.to_string(),
                    blob_sas_uri: blob_sas_uri.into(),
                    source_name: schema_id.into(),
                    source_version: version.to_string(),
                },
            },
            ver: version,
            name: ENVELOPE_NAME.to_string(),
            time: time.to_rfc3339_opts(SecondsFormat::Millis, true),
            ikey: instrumentation_key.into(),
        }
    }

    /// Envelope used to check that the endpoint is reachable.
    ///
    /// The endpoint rejects the null key, which still proves it is up.
    pub fn probe(blob_sas_uri: impl Into<String>, version: u32, time: DateTime<Utc>) -> Self {
        Self::new(GUID_NULL, GUID_NULL, blob_sas_uri, version, time)
    }

    pub fn schema_id(&self) -> &str {
        &self.data.base_data.source_name
    }

    pub fn blob_sas_uri(&self) -> &str {
        &self.data.base_data.blob_sas_uri
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_json_shape() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let envelope = NotificationEnvelope::new("ikey-1", "schema-1", "https://x/y?sig=z", 1, time);

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "data": {
                    "baseType": "OpenSchemaData",
                    "baseData": {
                        "ver": "2",
                        "blobSasUri": "https://x/y?sig=z",
                        "sourceName": "schema-1",
                        "sourceVersion": "1",
                    }
                },
                "ver": 1,
                "name": "Microsoft.ApplicationInsights.OpenSchema",
                "time": "2024-05-01T10:00:00.000Z",
                "iKey": "ikey-1",
            })
        );
    }
}
