/*
    core_bridge - Reference-mode bridging

    Connects CRDT models to the storage engine: snapshot conversions,
    entity-carrying container operations, and the driver that moves both
    directions while suppressing its own echoes.
*/

pub mod bridging;
pub mod convert;
pub mod driver;

pub use bridging::{apply_bridging_op, BridgingOperation};
pub use convert::{crdt_to_database, database_to_crdt, CrdtData};
pub use driver::{DatabaseDriver, Driver, DriverReceiver};
