// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
};

use crate::common::{
  connection::Connection,
  protocol::{AppId, ConnectionId, InstanceId},
};

#[derive(Debug, Clone)]
pub struct PublishedApp {
  pub app_id: AppId,
  pub instance_id: InstanceId,
  pub description: Arc<str>,
  pub owner: Arc<Connection>,
}

#[derive(Default)]
struct AppTable {
  /// Registry order, which is also the order instances are reported in
  apps: Vec<PublishedApp>,
  by_connection: HashMap<ConnectionId, Vec<InstanceId>>,
}

/// Every live publication known to the broker
#[derive(Default)]
pub struct AppRegistry {
  table: Mutex<AppTable>,
}

impl AppRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn table(&self) -> MutexGuard<'_, AppTable> {
    match self.table.lock() {
      Ok(table) => table,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Registers `description` as published by `owner`.
  ///
  /// Publishing the same description again on the same connection yields the
  /// same instance, which is reused rather than listed twice.
  pub fn publish(&self, owner: &Arc<Connection>, description: &str) -> PublishedApp {
    let app_id = AppId::for_description(description);
    let instance_id = InstanceId::for_publication(owner.peer(), description);
    let mut table = self.table();
    if let Some(existing) = table
      .apps
      .iter()
      .find(|app| app.instance_id == instance_id)
    {
      return existing.clone();
    }
    let app = PublishedApp {
      app_id,
      instance_id,
      description: Arc::from(description),
      owner: owner.clone(),
    };
    table.apps.push(app.clone());
    table
      .by_connection
      .entry(owner.id())
      .or_insert_with(Vec::new)
      .push(instance_id);
    app
  }

  pub fn instances_of(&self, app_id: &AppId) -> Vec<InstanceId> {
    self
      .table()
      .apps
      .iter()
      .filter(|app| &app.app_id == app_id)
      .map(|app| app.instance_id)
      .collect()
  }

  pub fn lookup(&self, instance_id: &InstanceId) -> Option<PublishedApp> {
    self
      .table()
      .apps
      .iter()
      .find(|app| &app.instance_id == instance_id)
      .cloned()
  }

  /// Removes every publication owned by `connection`, returning what was removed
  pub fn remove_owned_by(&self, connection: ConnectionId) -> Vec<PublishedApp> {
    let mut table = self.table();
    let owned = match table.by_connection.remove(&connection) {
      Some(owned) => owned,
      None => return Vec::new(),
    };
    let mut removed = Vec::with_capacity(owned.len());
    table.apps.retain(|app| {
      if owned.contains(&app.instance_id) {
        removed.push(app.clone());
        false
      } else {
        true
      }
    });
    removed
  }

  pub fn len(&self) -> usize {
    self.table().apps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio_util::sync::CancellationToken;

  use super::AppRegistry;
  use crate::common::{
    connection::{Connection, PeerAddress},
    protocol::{AppId, ConnectionId},
  };

  fn connection(id: u64) -> Arc<Connection> {
    let id = ConnectionId::new(id);
    Connection::new(
      id,
      PeerAddress::Memory(id),
      tokio::io::sink(),
      CancellationToken::new(),
    )
  }

  #[tokio::test]
  async fn publish_lookup_and_remove() {
    let registry = AppRegistry::new();
    let (a, b) = (connection(1), connection(2));
    let first = registry.publish(&a, "chat");
    let second = registry.publish(&b, "chat");
    let other = registry.publish(&a, "files");
    assert_eq!(first.app_id, second.app_id);
    assert_ne!(first.instance_id, second.instance_id);
    assert_eq!(first.app_id, AppId::for_description("chat"));

    assert_eq!(
      registry.instances_of(&first.app_id),
      vec![first.instance_id, second.instance_id]
    );
    assert_eq!(
      registry.lookup(&other.instance_id).unwrap().owner.id(),
      a.id()
    );

    let removed = registry.remove_owned_by(a.id());
    assert_eq!(removed.len(), 2);
    assert_eq!(registry.len(), 1);
    assert!(registry.lookup(&first.instance_id).is_none());
    assert_eq!(
      registry.instances_of(&first.app_id),
      vec![second.instance_id]
    );
    assert!(registry.remove_owned_by(a.id()).is_empty());
  }

  #[tokio::test]
  async fn republishing_is_idempotent() {
    let registry = AppRegistry::new();
    let owner = connection(1);
    let first = registry.publish(&owner, "chat");
    let again = registry.publish(&owner, "chat");
    assert_eq!(first.instance_id, again.instance_id);
    assert_eq!(registry.len(), 1);
  }
}
