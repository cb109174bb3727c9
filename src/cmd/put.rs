//! Upload command.

use std::path::PathBuf;

use console::style;
use tokio::fs::File;

use crate::{
   Result, config,
   types::{ResourceId, WriteRequest},
   util::format_size,
};

/// Stores `path` under an exclusive lease and prints the resource id.
pub async fn execute(
   path: PathBuf,
   id: Option<String>,
   filename: Option<String>,
   content_type: Option<String>,
   namespace: Option<String>,
) -> Result<()> {
   let broker = super::open_broker(namespace)?;

   let id = match id {
      Some(raw) => super::parse_id(&raw)?,
      None => ResourceId::generate(),
   };
   let mut request = WriteRequest::new().id(id).chunk_size(config::get().chunk_size);
   if let Some(name) =
      filename.or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
   {
      request = request.filename(name);
   }
   if let Some(content_type) = content_type {
      request = request.content_type(content_type);
   }

   let source = File::open(&path).await?;
   let len = source.metadata().await?.len();

   let Some(session) = broker.open_for_write(request).await? else {
      return Err(super::busy(id));
   };

   let bar = super::progress_bar(len, true);
   bar.set_message(format!("{}", path.display()));
   let stored = super::supervise(&session, &bar, session.copy_from(source)).await;
   bar.finish_and_clear();
   let stored = stored?;

   eprintln!(
      "{} stored {} ({})",
      style("✓").green(),
      style(stored.filename.as_deref().unwrap_or("-")).cyan(),
      format_size(stored.length)
   );
   println!("{}", stored.id);
   Ok(())
}
