pub mod asdu;
pub mod cproc;
pub mod csys;
pub mod mproc;
pub mod time;
