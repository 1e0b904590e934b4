//! TraCI 指令、變數與型別代碼

// 指令
pub const CMD_GETVERSION: u8 = 0x00;
pub const CMD_SIMSTEP: u8 = 0x02;
pub const CMD_CLOSE: u8 = 0x7F;

pub const CMD_GET_TL_VARIABLE: u8 = 0xa2;
pub const CMD_GET_LANE_VARIABLE: u8 = 0xa3;
pub const CMD_GET_VEHICLE_VARIABLE: u8 = 0xa4;
pub const CMD_GET_SIM_VARIABLE: u8 = 0xab;
pub const CMD_SET_TL_VARIABLE: u8 = 0xc2;

/// 查詢指令的回應代碼 = 指令 + 0x10
pub const RESPONSE_OFFSET: u8 = 0x10;

// 變數
pub const ID_LIST: u8 = 0x00;
pub const TL_PHASE_INDEX: u8 = 0x22;
pub const TL_CONTROLLED_LANES: u8 = 0x26;
pub const TL_CURRENT_PHASE: u8 = 0x28;
pub const TL_COMPLETE_DEFINITION_RYG: u8 = 0x2b;
pub const LAST_STEP_VEHICLE_HALTING_NUMBER: u8 = 0x14;
pub const VAR_SPEED: u8 = 0x40;
pub const VAR_WAITING_TIME: u8 = 0x7a;
pub const VAR_DELTA_T: u8 = 0x7b;
pub const VAR_MIN_EXPECTED_VEHICLES: u8 = 0x7d;
pub const VAR_COLLIDING_VEHICLES_NUMBER: u8 = 0x80;

// 型別
pub const TYPE_UBYTE: u8 = 0x07;
pub const TYPE_BYTE: u8 = 0x08;
pub const TYPE_INTEGER: u8 = 0x09;
pub const TYPE_DOUBLE: u8 = 0x0B;
pub const TYPE_STRING: u8 = 0x0C;
pub const TYPE_STRINGLIST: u8 = 0x0E;
pub const TYPE_COMPOUND: u8 = 0x0F;
pub const TYPE_DOUBLELIST: u8 = 0x10;

// 狀態
pub const RTYPE_OK: u8 = 0x00;
pub const RTYPE_NOTIMPLEMENTED: u8 = 0x01;
pub const RTYPE_ERR: u8 = 0xFF;

pub fn command_name(id: u8) -> &'static str {
    match id {
        CMD_GETVERSION => "getVersion",
        CMD_SIMSTEP => "simulationStep",
        CMD_CLOSE => "close",
        CMD_GET_TL_VARIABLE => "trafficlight.get",
        CMD_GET_LANE_VARIABLE => "lane.get",
        CMD_GET_VEHICLE_VARIABLE => "vehicle.get",
        CMD_GET_SIM_VARIABLE => "simulation.get",
        CMD_SET_TL_VARIABLE => "trafficlight.set",
        _ => "unknown",
    }
}
