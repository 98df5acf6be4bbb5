//! Reservation verbs. No scheduler integration is wired up, so all three
//! operations report a clean failure.

use anyhow::{bail, Result};

use crate::connector::Connector;

pub fn make_reservation(_message: &str, _connector: &mut dyn Connector) -> Result<()> {
    bail!("Reservation not supported!")
}

pub fn query_reservation(_message: &str, _connector: &mut dyn Connector) -> Result<()> {
    bail!("Reservation not supported!")
}

pub fn cancel_reservation(_message: &str, _connector: &mut dyn Connector) -> Result<()> {
    bail!("Reservation not supported!")
}
