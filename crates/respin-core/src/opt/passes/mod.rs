pub mod arith_identity;
pub mod dead_store;
pub mod flag_liveness;
pub mod redundant_mov;
