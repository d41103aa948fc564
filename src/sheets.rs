use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use urlencoding::encode;

use crate::engine::error::StoreError;
use crate::engine::record::Schema;
use crate::engine::store::{RangeSpec, RangeWrite, RemoteStore, TableHandle};

pub const DEFAULT_API_URL: &str = "https://sheets.googleapis.com";
const NEW_TABLE_ROWS: u32 = 1000;
const MIN_TABLE_COLS: u32 = 26;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Spreadsheet values API client for one spreadsheet.
#[derive(Debug, Clone)]
pub struct SheetsClient {
    http: Client,
    api_url: String,
    spreadsheet_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    #[serde(default)]
    row_count: u32,
    #[serde(default)]
    column_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
    grid_properties: Option<GridProperties>,
}

impl SheetProperties {
    fn into_handle(self) -> TableHandle {
        let (rows, cols) = self
            .grid_properties
            .map(|grid| (grid.row_count, grid.column_count))
            .unwrap_or((0, 0));
        TableHandle::new(self.title, self.sheet_id, rows, cols)
    }
}

#[derive(Debug, Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMetadata {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddSheetReply {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateReply {
    add_sheet: Option<AddSheetReply>,
}

#[derive(Debug, Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<BatchUpdateReply>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueRangeBody<'a> {
    range: String,
    major_dimension: &'static str,
    values: &'a [Vec<String>],
}

impl SheetsClient {
    pub fn new(api_url: &str, spreadsheet_id: &str, access_token: &str) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| StoreError::Network(err.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.to_string(),
            access_token: access_token.to_string(),
        })
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}{suffix}",
            self.api_url,
            encode(&self.spreadsheet_id)
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Network(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::from_status(status.as_u16(), body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))
    }

    async fn batch_update(&self, requests: Vec<JsonValue>) -> Result<BatchUpdateResponse, StoreError> {
        let url = self.url(":batchUpdate");
        debug!(requests = requests.len(), "spreadsheet batchUpdate");
        self.send_json(
            self.request(Method::POST, &url)
                .json(&json!({ "requests": requests })),
        )
        .await
    }
}

/// Groups descending row numbers into descending `(first, last)` runs.
fn contiguous_runs(rows: &[u32]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &row in rows {
        match runs.last_mut() {
            Some((first, _)) if *first == row + 1 => *first = row,
            _ => runs.push((row, row)),
        }
    }
    runs
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RemoteStore for SheetsClient {
    async fn open_table(&self, tab: &str) -> Result<Option<TableHandle>, StoreError> {
        let url = self.url("?fields=sheets.properties");
        let metadata: SpreadsheetMetadata = self.send_json(self.request(Method::GET, &url)).await?;
        Ok(metadata
            .sheets
            .into_iter()
            .map(|sheet| sheet.properties)
            .find(|props| props.title == tab)
            .map(SheetProperties::into_handle))
    }

    async fn create_table(&self, tab: &str, schema: &Schema) -> Result<TableHandle, StoreError> {
        let cols = (schema.len() as u32).max(MIN_TABLE_COLS);
        let response = self
            .batch_update(vec![json!({
                "addSheet": {
                    "properties": {
                        "title": tab,
                        "gridProperties": { "rowCount": NEW_TABLE_ROWS, "columnCount": cols }
                    }
                }
            })])
            .await?;
        response
            .replies
            .into_iter()
            .find_map(|reply| reply.add_sheet)
            .map(|reply| reply.properties.into_handle())
            .ok_or_else(|| StoreError::Decode("addSheet reply missing".to_string()))
    }

    async fn read_range(
        &self,
        _handle: &TableHandle,
        range: &RangeSpec,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let url = self.url(&format!("/values/{}", encode(&range.to_string())));
        let body: ValueRange = self.send_json(self.request(Method::GET, &url)).await?;
        Ok(body
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    async fn write_range(
        &self,
        _handle: &TableHandle,
        range: &RangeSpec,
        values: Vec<Vec<String>>,
    ) -> Result<(), StoreError> {
        let a1 = range.to_string();
        let url = self.url(&format!("/values/{}?valueInputOption=RAW", encode(&a1)));
        let body = ValueRangeBody {
            range: a1,
            major_dimension: "ROWS",
            values: &values,
        };
        self.send(self.request(Method::PUT, &url).json(&body)).await?;
        Ok(())
    }

    async fn batch_write_ranges(
        &self,
        _handle: &TableHandle,
        writes: Vec<RangeWrite>,
    ) -> Result<(), StoreError> {
        let url = self.url("/values:batchUpdate");
        let data: Vec<ValueRangeBody<'_>> = writes
            .iter()
            .map(|write| ValueRangeBody {
                range: write.range.to_string(),
                major_dimension: "ROWS",
                values: &write.values,
            })
            .collect();
        let body = json!({ "valueInputOption": "RAW", "data": data });
        self.send(self.request(Method::POST, &url).json(&body)).await?;
        Ok(())
    }

    async fn resize_grid(
        &self,
        handle: &TableHandle,
        rows: u32,
        cols: u32,
    ) -> Result<(), StoreError> {
        self.batch_update(vec![json!({
            "updateSheetProperties": {
                "properties": {
                    "sheetId": handle.sheet_id,
                    "gridProperties": { "rowCount": rows, "columnCount": cols }
                },
                "fields": "gridProperties.rowCount,gridProperties.columnCount"
            }
        })])
        .await?;
        Ok(())
    }

    async fn delete_rows(&self, handle: &TableHandle, rows: &[u32]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let requests = contiguous_runs(rows)
            .into_iter()
            .map(|(first, last)| {
                json!({
                    "deleteDimension": {
                        "range": {
                            "sheetId": handle.sheet_id,
                            "dimension": "ROWS",
                            "startIndex": first - 1,
                            "endIndex": last
                        }
                    }
                })
            })
            .collect();
        self.batch_update(requests).await?;
        Ok(())
    }
}
