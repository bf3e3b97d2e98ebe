//! JSON persistence, one file per order at `{dir}/{order_id}.json`.
//!
//! Every write goes through [`utils::fs::write_file_atomic`], so a crash
//! mid-write leaves the previous record intact.

use super::order::Order;
use crate::error::{SwapError, SwapResult};
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct OrderStore {
    dir: PathBuf,
}

impl OrderStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an order's record. Identifiers may not contain path syntax.
    pub fn path(&self, order_id: &str) -> SwapResult<PathBuf> {
        let valid = !order_id.is_empty()
            && order_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SwapError::config(format!("Invalid order id: {:?}", order_id)));
        }
        Ok(self.dir.join(format!("{}.json", order_id)))
    }

    pub fn exists(&self, order_id: &str) -> SwapResult<bool> {
        Ok(self.path(order_id)?.exists())
    }

    /// Persist a new order, refusing to overwrite an existing one
    pub fn create(&self, order: &Order) -> SwapResult<PathBuf> {
        if self.exists(&order.order_id)? {
            return Err(SwapError::config(format!(
                "Order {} already exists",
                order.order_id
            )));
        }
        self.save(order)
    }

    /// Atomically replace the order's record
    pub fn save(&self, order: &Order) -> SwapResult<PathBuf> {
        utils::fs::ensure_dir_exists(&self.dir)?;
        let path = self.path(&order.order_id)?;
        let json = serde_json::to_string_pretty(order)?;
        utils::fs::write_file_atomic(&path, json.as_bytes())?;
        log::debug!("Saved order {} ({}) to {}", order.order_id, order.status, path.display());
        Ok(path)
    }

    pub fn load(&self, order_id: &str) -> SwapResult<Order> {
        let path = self.path(order_id)?;
        if !path.exists() {
            return Err(SwapError::OrderNotFound {
                order_id: order_id.to_string(),
            });
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All stored orders, oldest first. Unreadable records are skipped with a warning.
    pub fn list(&self) -> SwapResult<Vec<Order>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut orders = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some("json")
                && !path.to_string_lossy().ends_with(".json.tmp");
            if !is_record {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(SwapError::from)
                .and_then(|content| serde_json::from_str::<Order>(&content).map_err(SwapError::from))
            {
                Ok(order) => orders.push(order),
                Err(e) => log::warn!("Skipping unreadable order file {}: {}", path.display(), e),
            }
        }
        orders.sort_by_key(|order| order.created_at);
        Ok(orders)
    }
}
