use crate::error::SyncError;
use crate::remote::{ExternalId, RemoteError, Repository, VersionSelector};
use crate::sync::config::ServerConfig;
use crate::sync::deadline::Deadline;
use crate::sync::record::{CanonicalFields, DESCRIPTION_FIELD};
use crate::sync::schema::Schema;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, multipart};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const KEY_HEADER: &str = "X-Dataverse-key";
const PLACEHOLDER_SUBJECT: &str = "Other";

/// Dataverse native API client.
pub struct DataverseClient {
    http: Client,
    base_url: String,
    api_key: String,
    collection: String,
    request_timeout: Duration,
    publish_type: String,
    placeholder_author: String,
    contact_email: String,
    schema: Schema,
}

fn transport(err: reqwest::Error, stage: &str, deadline: &Deadline) -> SyncError {
    if err.is_timeout() && deadline.remaining().is_zero() {
        return SyncError::TimeoutExceeded {
            stage: stage.to_string(),
            limit_secs: deadline.limit().as_secs(),
        };
    }
    SyncError::Remote(RemoteError::Transport(err.to_string()))
}

impl DataverseClient {
    pub fn new(server: &ServerConfig, schema: Schema) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(server.request_timeout_secs))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: server.base_url.trim_end_matches('/').to_string(),
            api_key: server.api_key.clone(),
            collection: server.collection.clone(),
            request_timeout: Duration::from_secs(server.request_timeout_secs),
            publish_type: server.publish_type.clone(),
            placeholder_author: server.placeholder_author.clone(),
            contact_email: server.contact_email.clone(),
            schema,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send, unwrap the `{"status": "OK", "data": ...}` envelope and return
    /// `data`.
    fn send(
        &self,
        request: RequestBuilder,
        stage: &str,
        deadline: &Deadline,
    ) -> Result<Value, SyncError> {
        deadline.check(stage)?;
        let mut request = request.timeout(deadline.cap(self.request_timeout));
        if !self.api_key.is_empty() {
            request = request.header(KEY_HEADER, &self.api_key);
        }
        let response = request
            .send()
            .map_err(|err| transport(err, stage, deadline))?;
        let status = response.status();
        let url = response.url().to_string();
        debug!(stage, %url, status = status.as_u16(), "dataverse response");
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(url).into());
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RemoteError::Status {
                code: status.as_u16(),
                body: crate::sync::util::truncate_with_ellipsis(&body, 240),
            }
            .into());
        }
        let mut envelope: Value = response
            .json()
            .map_err(|err| RemoteError::Decode(format!("{stage}: {err}")))?;
        if envelope.get("status").and_then(Value::as_str) != Some("OK") {
            return Err(RemoteError::Decode(format!("{stage}: status is not OK")).into());
        }
        Ok(envelope
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    fn version_url(&self, version: VersionSelector) -> String {
        self.url(&format!(
            "datasets/:persistentId/versions/{}",
            version.as_str()
        ))
    }

    fn publish_as(&self, id: &str, kind: &str, deadline: &Deadline) -> Result<(), SyncError> {
        let request = self
            .http
            .post(self.url("datasets/:persistentId/actions/:publish"))
            .query(&[("persistentId", id), ("type", kind)]);
        self.send(request, "publish", deadline)?;
        Ok(())
    }
}

impl Repository for DataverseClient {
    fn search(&self, query: &str, deadline: &Deadline) -> Result<Option<ExternalId>, SyncError> {
        let request = self
            .http
            .get(self.url("search"))
            .query(&[("q", query), ("show_entity_ids", "true")]);
        let data = self.send(request, "search", deadline)?;
        let items = data
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| RemoteError::Decode("search: no items".to_string()))?;
        match items.as_slice() {
            [] => Ok(None),
            [only] => only
                .get("global_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| {
                    RemoteError::Decode("search: item without global_id".to_string()).into()
                }),
            many => Err(RemoteError::AmbiguousMatch { count: many.len() }.into()),
        }
    }

    fn create_entity(
        &self,
        title: &str,
        description: &str,
        deadline: &Deadline,
    ) -> Result<ExternalId, SyncError> {
        let mut fields = CanonicalFields::new();
        fields.insert("Title".to_string(), title.to_string());
        fields.insert(DESCRIPTION_FIELD.to_string(), description.to_string());
        fields.insert("Author".to_string(), self.placeholder_author.clone());
        fields.insert("Dataverse Contact".to_string(), self.contact_email.clone());
        fields.insert("Dataverse Subject".to_string(), PLACEHOLDER_SUBJECT.to_string());
        let blocks = self.schema.metadata_blocks(&fields)?;
        let body = json!({ "datasetVersion": { "metadataBlocks": blocks } });

        let request = self
            .http
            .post(self.url(&format!("dataverses/{}/datasets", self.collection)))
            .json(&body);
        let data = self.send(request, "create", deadline)?;
        let id = data
            .get("persistentId")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Decode("create: no persistentId".to_string()))?
            .to_string();
        // A first version must be released before it can be fetched as published.
        self.publish_as(&id, "major", deadline)?;
        Ok(id)
    }

    fn probe(&self, id: &str, deadline: &Deadline) -> Result<(), SyncError> {
        match self.fetch_snapshot(id, VersionSelector::Published, deadline) {
            Ok(_) => Ok(()),
            Err(SyncError::Remote(RemoteError::NotFound(_))) => {
                Err(RemoteError::NotYetQueryable(id.to_string()).into())
            }
            Err(other) => Err(other),
        }
    }

    fn fetch_snapshot(
        &self,
        id: &str,
        version: VersionSelector,
        deadline: &Deadline,
    ) -> Result<Value, SyncError> {
        let request = self
            .http
            .get(self.version_url(version))
            .query(&[("persistentId", id)]);
        let data = self.send(request, "fetch", deadline)?;
        if !data.is_object() {
            return Err(SyncError::MalformedInput(format!(
                "snapshot for {id} is not a mapping"
            )));
        }
        Ok(data)
    }

    fn push_snapshot(
        &self,
        id: &str,
        snapshot: &Value,
        deadline: &Deadline,
    ) -> Result<Value, SyncError> {
        let request = self
            .http
            .put(self.version_url(VersionSelector::Draft))
            .query(&[("persistentId", id)])
            .json(snapshot);
        self.send(request, "push", deadline)
    }

    fn publish(&self, id: &str, deadline: &Deadline) -> Result<(), SyncError> {
        self.publish_as(id, &self.publish_type, deadline)
    }

    fn replace_attached_file(
        &self,
        id: &str,
        path: &Path,
        deadline: &Deadline,
    ) -> Result<(), SyncError> {
        let listing = self.send(
            self.http
                .get(self.url("datasets/:persistentId/versions/:draft/files"))
                .query(&[("persistentId", id)]),
            "list-files",
            deadline,
        )?;
        let file_ids: Vec<u64> = listing
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f.pointer("/dataFile/id").and_then(Value::as_u64))
                    .collect()
            })
            .unwrap_or_default();
        for file_id in file_ids {
            self.send(
                self.http.delete(self.url(&format!("files/{file_id}"))),
                "delete-file",
                deadline,
            )?;
        }

        let form = multipart::Form::new()
            .file("file", path)
            .map_err(|err| RemoteError::Transport(format!("{}: {err}", path.display())))?;
        self.send(
            self.http
                .post(self.url("datasets/:persistentId/add"))
                .query(&[("persistentId", id)])
                .multipart(form),
            "upload-file",
            deadline,
        )?;
        Ok(())
    }
}
