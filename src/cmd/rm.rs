//! Remove command.

use console::style;

use crate::{
   Result,
   types::{RemoveOutcome, RemoveRequest},
};

pub async fn execute(id: String, namespace: Option<String>) -> Result<()> {
   let broker = super::open_broker(namespace)?;
   let id = super::parse_id(&id)?;

   match broker.remove(RemoveRequest::for_id(id)).await? {
      RemoveOutcome::Removed => {
         println!("{} removed {}", style("✓").green(), style(id).cyan());
         Ok(())
      },
      RemoveOutcome::NotFound => Err(super::not_found(id)),
      RemoveOutcome::Busy => Err(super::busy(id)),
   }
}
