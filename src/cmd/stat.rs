//! Lease-free metadata commands: `exists` and `stat`.

use crate::{Result, types::ExistsRequest};

/// Prints `true` or `false`.
pub async fn exists(id: String, namespace: Option<String>) -> Result<()> {
   let broker = super::open_broker(namespace)?;
   let id = super::parse_id(&id)?;
   println!("{}", broker.exists(ExistsRequest::for_id(id)).await?);
   Ok(())
}

/// Prints the stored-file record as JSON.
pub async fn stat(id: String, namespace: Option<String>) -> Result<()> {
   let broker = super::open_broker(namespace)?;
   let id = super::parse_id(&id)?;
   let Some(file) = broker.stat(ExistsRequest::for_id(id)).await? else {
      return Err(super::not_found(id));
   };
   println!("{}", serde_json::to_string_pretty(&file)?);
   Ok(())
}
