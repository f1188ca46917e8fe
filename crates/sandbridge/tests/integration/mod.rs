mod capture;
mod common;
mod console;
mod eval;
mod hostcall;
mod shelter;
