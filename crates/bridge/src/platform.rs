//! Typed client for the remote hosting platform API.
//!
//! Every call carries a bearer token and an optional team-id query
//! parameter. Non-success responses are classified by status code and the
//! body text is preserved for diagnostics.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, RemoteErrorKind};

pub mod types;

use self::types::{
    CreateDeploymentRequest, CreateProjectRequest, CronToggleRequest, DeploymentListResponse,
    EnvVarListResponse, EnvVarWriteRequest, ProjectDomain, ProjectDomainsResponse, RemoteDeployment,
    RemoteEnvVar, RemoteProject, UpdateProjectRequest,
};

/// Token + optional team scope for one request. Produced by the credential
/// resolver; the client itself holds no credential state.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub token: String,
    pub team_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
}

impl PlatformClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str, credentials: &ApiCredentials) -> String {
        match credentials.team_id.as_deref() {
            Some(team_id) => format!("{}{path}?teamId={team_id}", self.base_url),
            None => format!("{}{path}", self.base_url),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        credentials: &ApiCredentials,
    ) -> Result<T, EngineError> {
        let response = self
            .http
            .get(self.url(path, credentials))
            .bearer_auth(&credentials.token)
            .send()
            .await
            .map_err(|error| transport_error(operation, &error))?;

        decode(operation, check(operation, response).await?).await
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: reqwest::Method,
        path: &str,
        credentials: &ApiCredentials,
        body: &B,
    ) -> Result<T, EngineError> {
        let response = self
            .http
            .request(method, self.url(path, credentials))
            .bearer_auth(&credentials.token)
            .json(body)
            .send()
            .await
            .map_err(|error| transport_error(operation, &error))?;

        decode(operation, check(operation, response).await?).await
    }

    async fn send_no_content<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        method: reqwest::Method,
        path: &str,
        credentials: &ApiCredentials,
        body: Option<&B>,
    ) -> Result<(), EngineError> {
        let mut request = self
            .http
            .request(method, self.url(path, credentials))
            .bearer_auth(&credentials.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| transport_error(operation, &error))?;

        check(operation, response).await?;
        Ok(())
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn create_project(
        &self,
        credentials: &ApiCredentials,
        request: &CreateProjectRequest,
    ) -> Result<RemoteProject, EngineError> {
        self.send_json(
            "project create",
            reqwest::Method::POST,
            "/v1/projects",
            credentials,
            request,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn get_project(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
    ) -> Result<RemoteProject, EngineError> {
        self.get_json(
            "project detail",
            &format!("/v1/projects/{project_id}"),
            credentials,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn update_project(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
        request: &UpdateProjectRequest,
    ) -> Result<RemoteProject, EngineError> {
        self.send_json(
            "project update",
            reqwest::Method::PATCH,
            &format!("/v1/projects/{project_id}"),
            credentials,
            request,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn delete_project(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
    ) -> Result<(), EngineError> {
        self.send_no_content::<()>(
            "project delete",
            reqwest::Method::DELETE,
            &format!("/v1/projects/{project_id}"),
            credentials,
            None,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn list_project_domains(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
    ) -> Result<Vec<ProjectDomain>, EngineError> {
        let response: ProjectDomainsResponse = self
            .get_json(
                "project domains",
                &format!("/v1/projects/{project_id}/domains"),
                credentials,
            )
            .await?;

        Ok(response.domains)
    }

    /// Lists the most recent deployments for a project, newest first.
    ///
    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn list_deployments(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<RemoteDeployment>, EngineError> {
        let path = match credentials.team_id.as_deref() {
            Some(team_id) => {
                format!("/v1/deployments?projectId={project_id}&limit={limit}&teamId={team_id}")
            }
            None => format!("/v1/deployments?projectId={project_id}&limit={limit}"),
        };

        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&credentials.token)
            .send()
            .await
            .map_err(|error| transport_error("deployment list", &error))?;

        let response: DeploymentListResponse =
            decode("deployment list", check("deployment list", response).await?).await?;
        Ok(response.deployments)
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn create_deployment(
        &self,
        credentials: &ApiCredentials,
        request: &CreateDeploymentRequest,
    ) -> Result<RemoteDeployment, EngineError> {
        self.send_json(
            "deployment create",
            reqwest::Method::POST,
            "/v1/deployments",
            credentials,
            request,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn cancel_deployment(
        &self,
        credentials: &ApiCredentials,
        deployment_id: &str,
    ) -> Result<(), EngineError> {
        self.send_no_content::<()>(
            "deployment cancel",
            reqwest::Method::PATCH,
            &format!("/v1/deployments/{deployment_id}/cancel"),
            credentials,
            None,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn delete_deployment(
        &self,
        credentials: &ApiCredentials,
        deployment_id: &str,
    ) -> Result<(), EngineError> {
        self.send_no_content::<()>(
            "deployment delete",
            reqwest::Method::DELETE,
            &format!("/v1/deployments/{deployment_id}"),
            credentials,
            None,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn list_env_vars(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
    ) -> Result<Vec<RemoteEnvVar>, EngineError> {
        let response: EnvVarListResponse = self
            .get_json(
                "env list",
                &format!("/v1/projects/{project_id}/env"),
                credentials,
            )
            .await?;

        Ok(response.envs)
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn create_env_var(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
        request: &EnvVarWriteRequest,
    ) -> Result<RemoteEnvVar, EngineError> {
        self.send_json(
            "env create",
            reqwest::Method::POST,
            &format!("/v1/projects/{project_id}/env"),
            credentials,
            request,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn update_env_var(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
        env_id: &str,
        request: &EnvVarWriteRequest,
    ) -> Result<RemoteEnvVar, EngineError> {
        self.send_json(
            "env update",
            reqwest::Method::PATCH,
            &format!("/v1/projects/{project_id}/env/{env_id}"),
            credentials,
            request,
        )
        .await
    }

    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn delete_env_var(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
        env_id: &str,
    ) -> Result<(), EngineError> {
        self.send_no_content::<()>(
            "env delete",
            reqwest::Method::DELETE,
            &format!("/v1/projects/{project_id}/env/{env_id}"),
            credentials,
            None,
        )
        .await
    }

    /// Pauses or resumes the project's cron jobs.
    ///
    /// # Errors
    /// Returns a classified error on transport or API failure.
    pub async fn toggle_crons(
        &self,
        credentials: &ApiCredentials,
        project_id: &str,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.send_no_content(
            "cron toggle",
            reqwest::Method::PATCH,
            &format!("/v1/projects/{project_id}/crons"),
            credentials,
            Some(&CronToggleRequest { enabled }),
        )
        .await
    }
}

async fn check(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = response.text().await.unwrap_or_default();
    Err(classify(operation, status, detail))
}

async fn decode<T: DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T, EngineError> {
    response.json::<T>().await.map_err(|error| EngineError::RemoteApi {
        operation,
        kind: RemoteErrorKind::Unknown,
        detail: format!("invalid response body: {error}"),
    })
}

fn transport_error(operation: &'static str, error: &reqwest::Error) -> EngineError {
    EngineError::RemoteApi {
        operation,
        kind: RemoteErrorKind::Unknown,
        detail: error.to_string(),
    }
}

fn classify(operation: &'static str, status: http::StatusCode, detail: String) -> EngineError {
    match RemoteErrorKind::from_status(status) {
        RemoteErrorKind::NotFound => EngineError::RemoteNotFound { operation, detail },
        RemoteErrorKind::Conflict => EngineError::RemoteConflict { operation, detail },
        kind => EngineError::RemoteApi {
            operation,
            kind,
            detail: format!("{status}: {detail}"),
        },
    }
}
