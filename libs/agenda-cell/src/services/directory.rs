// libs/agenda-cell/src/services/directory.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tracing::warn;

use shared_database::supabase::SupabaseClient;

use crate::models::{hhmm, AgendaConfig, Professional};
use crate::services::repository::RepositoryError;

/// Who can be booked at a center, and how their day is cut.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn professionals(&self, center_id: &str) -> Result<Vec<Professional>, RepositoryError>;

    async fn agenda_config(&self, professional_id: &str) -> Result<Option<AgendaConfig>, RepositoryError>;
}

// ==============================================================================
// STATIC DIRECTORY
// ==============================================================================

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    professionals: Vec<Professional>,
    configs: HashMap<String, AgendaConfig>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_professional(mut self, professional: Professional, config: Option<AgendaConfig>) -> Self {
        if let Some(config) = config {
            self.configs.insert(professional.id.clone(), config);
        }
        self.professionals.push(professional);
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn professionals(&self, center_id: &str) -> Result<Vec<Professional>, RepositoryError> {
        Ok(self
            .professionals
            .iter()
            .filter(|p| p.center_id == center_id)
            .cloned()
            .collect())
    }

    async fn agenda_config(&self, professional_id: &str) -> Result<Option<AgendaConfig>, RepositoryError> {
        Ok(self.configs.get(professional_id).cloned())
    }
}

// ==============================================================================
// SUPABASE DIRECTORY
// ==============================================================================

#[derive(Debug, Deserialize)]
struct AgendaConfigRow {
    slot_duration: u32,
    start_time: String,
    end_time: String,
}

pub struct SupabaseDirectory {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseDirectory {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl Directory for SupabaseDirectory {
    async fn professionals(&self, center_id: &str) -> Result<Vec<Professional>, RepositoryError> {
        let path = format!(
            "/rest/v1/professionals?center_id=eq.{}&active=eq.true&select=id,center_id,name,specialty&order=name.asc",
            urlencoding::encode(center_id)
        );
        self.supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))
    }

    async fn agenda_config(&self, professional_id: &str) -> Result<Option<AgendaConfig>, RepositoryError> {
        let path = format!(
            "/rest/v1/agenda_configs?professional_id=eq.{}&limit=1",
            urlencoding::encode(professional_id)
        );
        let rows: Vec<AgendaConfigRow> = self.supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let parse = |raw: &str| {
            hhmm::parse(raw).map_err(|_| RepositoryError::Malformed(format!("bad time {:?}", raw)))
        };
        let config = AgendaConfig {
            slot_duration: row.slot_duration,
            start_time: parse(&row.start_time)?,
            end_time: parse(&row.end_time)?,
        };

        if let Err(e) = config.validate() {
            warn!("Ignoring invalid agenda config of {}: {}", professional_id, e);
            return Ok(None);
        }
        Ok(Some(config))
    }
}
