//! Download command.

use std::path::PathBuf;

use console::style;
use tokio::{fs::File, io};

use crate::{
   Result,
   types::{ExistsRequest, ReadRequest},
   util::format_size,
};

/// Streams a resource (or an inclusive byte range of it) to `out` or stdout.
pub async fn execute(
   id: String,
   out: Option<PathBuf>,
   start: Option<u64>,
   end: Option<u64>,
   namespace: Option<String>,
) -> Result<()> {
   let broker = super::open_broker(namespace)?;
   let id = super::parse_id(&id)?;

   let mut request = ReadRequest::for_id(id);
   if start.is_some() || end.is_some() {
      let Some(file) = broker.stat(ExistsRequest::for_id(id)).await? else {
         return Err(super::not_found(id));
      };
      let last = file.length.saturating_sub(1);
      request = request.range(start.unwrap_or(0), end.unwrap_or(last));
   }

   let Some(session) = broker.open_for_read(request).await? else {
      return Err(super::busy(id));
   };
   let total = session.file().length;

   let copied = match &out {
      Some(path) => {
         let mut dest = File::create(path).await?;
         let bar = super::progress_bar(total, true);
         let copied = super::supervise(&session, &bar, session.copy_to(&mut dest)).await;
         bar.finish_and_clear();
         copied?
      },
      None => {
         let mut stdout = io::stdout();
         let bar = super::progress_bar(total, false);
         super::supervise(&session, &bar, session.copy_to(&mut stdout)).await?
      },
   };

   if let Some(path) = out {
      eprintln!(
         "{} wrote {} to {}",
         style("✓").green(),
         format_size(copied),
         style(path.display()).cyan()
      );
   }
   Ok(())
}
