//! TraCI 二進位格式：全部 big-endian。
//!
//! 訊息 = i32 總長度（含自身 4 bytes）+ 若干指令；
//! 指令 = u8 長度（超過 255 時為 0 + i32 長度）+ u8 指令代碼 + 內容。

use super::constants::*;
use crate::domain::model::{PhaseDef, TlsProgram};
use crate::utils::error::{Result, TrafficError};

#[derive(Debug, Clone, PartialEq)]
pub enum TraciValue {
    UByte(u8),
    Byte(i8),
    Int(i32),
    Double(f64),
    Str(String),
    StrList(Vec<String>),
    Compound(Vec<TraciValue>),
    DoubleList(Vec<f64>),
}

impl TraciValue {
    pub fn type_tag(&self) -> u8 {
        match self {
            TraciValue::UByte(_) => TYPE_UBYTE,
            TraciValue::Byte(_) => TYPE_BYTE,
            TraciValue::Int(_) => TYPE_INTEGER,
            TraciValue::Double(_) => TYPE_DOUBLE,
            TraciValue::Str(_) => TYPE_STRING,
            TraciValue::StrList(_) => TYPE_STRINGLIST,
            TraciValue::Compound(_) => TYPE_COMPOUND,
            TraciValue::DoubleList(_) => TYPE_DOUBLELIST,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            TraciValue::UByte(_) => "ubyte",
            TraciValue::Byte(_) => "byte",
            TraciValue::Int(_) => "int",
            TraciValue::Double(_) => "double",
            TraciValue::Str(_) => "string",
            TraciValue::StrList(_) => "stringlist",
            TraciValue::Compound(_) => "compound",
            TraciValue::DoubleList(_) => "doublelist",
        }
    }

    /// 寫入型別代碼與內容
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.type_tag());
        match self {
            TraciValue::UByte(v) => out.push(*v),
            TraciValue::Byte(v) => out.extend_from_slice(&v.to_be_bytes()),
            TraciValue::Int(v) => put_i32(out, *v),
            TraciValue::Double(v) => put_f64(out, *v),
            TraciValue::Str(s) => put_string(out, s),
            TraciValue::StrList(list) => {
                put_i32(out, list.len() as i32);
                for s in list {
                    put_string(out, s);
                }
            }
            TraciValue::Compound(items) => {
                put_i32(out, items.len() as i32);
                for item in items {
                    item.encode(out);
                }
            }
            TraciValue::DoubleList(list) => {
                put_i32(out, list.len() as i32);
                for v in list {
                    put_f64(out, *v);
                }
            }
        }
    }

    fn mismatch(&self, expected: &str) -> TrafficError {
        TrafficError::protocol(format!("expected {}, got {}", expected, self.type_name()))
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            TraciValue::Double(v) => Ok(*v),
            TraciValue::Int(v) => Ok(f64::from(*v)),
            other => Err(other.mismatch("double")),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            TraciValue::Int(v) => Ok(*v),
            TraciValue::UByte(v) => Ok(i32::from(*v)),
            TraciValue::Byte(v) => Ok(i32::from(*v)),
            other => Err(other.mismatch("int")),
        }
    }

    /// 非負整數（計數、索引）
    pub fn as_count(&self) -> Result<u32> {
        let v = self.as_i32()?;
        u32::try_from(v).map_err(|_| TrafficError::protocol(format!("negative count {}", v)))
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            TraciValue::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn into_string_list(self) -> Result<Vec<String>> {
        match self {
            TraciValue::StrList(list) => Ok(list),
            other => Err(other.mismatch("stringlist")),
        }
    }

    pub fn into_compound(self) -> Result<Vec<TraciValue>> {
        match self {
            TraciValue::Compound(items) => Ok(items),
            other => Err(other.mismatch("compound")),
        }
    }
}

pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_i32(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

/// 指令長度包含長度欄位本身
pub fn encode_command(id: u8, payload: &[u8]) -> Vec<u8> {
    let short_len = 1 + 1 + payload.len();
    let mut out = Vec::with_capacity(short_len + 4);
    if short_len <= usize::from(u8::MAX) {
        out.push(short_len as u8);
    } else {
        out.push(0);
        put_i32(&mut out, (short_len + 4) as i32);
    }
    out.push(id);
    out.extend_from_slice(payload);
    out
}

pub fn encode_message(commands: &[Vec<u8>]) -> Vec<u8> {
    let body: usize = commands.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(4 + body);
    put_i32(&mut out, (4 + body) as i32);
    for cmd in commands {
        out.extend_from_slice(cmd);
    }
    out
}

pub fn get_variable_command(domain: u8, variable: u8, object_id: &str) -> Vec<u8> {
    let mut payload = vec![variable];
    put_string(&mut payload, object_id);
    encode_command(domain, &payload)
}

pub fn set_variable_command(domain: u8, variable: u8, object_id: &str, value: &TraciValue) -> Vec<u8> {
    let mut payload = vec![variable];
    put_string(&mut payload, object_id);
    value.encode(&mut payload);
    encode_command(domain, &payload)
}

pub fn simulation_step_command(target_time: f64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    put_f64(&mut payload, target_time);
    encode_command(CMD_SIMSTEP, &payload)
}

/// 順序讀取回應內容
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(TrafficError::protocol(format!(
                "unexpected end of message: need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn skip_to(&mut self, pos: usize) -> Result<()> {
        if pos < self.pos || pos > self.buf.len() {
            return Err(TrafficError::protocol(format!(
                "invalid command boundary {} (at {}, length {})",
                pos,
                self.pos,
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    fn read_len(&mut self) -> Result<usize> {
        let n = self.read_i32()?;
        usize::try_from(n).map_err(|_| TrafficError::protocol(format!("negative length {}", n)))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        // SUMO 可能送出 latin-1 的 id
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let n = self.read_len()?;
        (0..n).map(|_| self.read_string()).collect()
    }

    pub fn read_typed(&mut self) -> Result<TraciValue> {
        let tag = self.read_u8()?;
        Ok(match tag {
            TYPE_UBYTE => TraciValue::UByte(self.read_u8()?),
            TYPE_BYTE => TraciValue::Byte(i8::from_be_bytes(self.take_array()?)),
            TYPE_INTEGER => TraciValue::Int(self.read_i32()?),
            TYPE_DOUBLE => TraciValue::Double(self.read_f64()?),
            TYPE_STRING => TraciValue::Str(self.read_string()?),
            TYPE_STRINGLIST => TraciValue::StrList(self.read_string_list()?),
            TYPE_COMPOUND => {
                let n = self.read_len()?;
                let items = (0..n)
                    .map(|_| self.read_typed())
                    .collect::<Result<Vec<_>>>()?;
                TraciValue::Compound(items)
            }
            TYPE_DOUBLELIST => {
                let n = self.read_len()?;
                let items = (0..n).map(|_| self.read_f64()).collect::<Result<Vec<_>>>()?;
                TraciValue::DoubleList(items)
            }
            other => {
                return Err(TrafficError::protocol(format!(
                    "unsupported value type 0x{:02x}",
                    other
                )))
            }
        })
    }

    /// 讀指令標頭，回傳 (指令代碼, 指令結束位置)
    pub fn read_command_header(&mut self) -> Result<(u8, usize)> {
        let start = self.pos;
        let short = self.read_u8()?;
        let len = if short == 0 { self.read_len()? } else { usize::from(short) };
        let id = self.read_u8()?;
        let end = start + len;
        if end > self.buf.len() || end < self.pos {
            return Err(TrafficError::protocol(format!(
                "command 0x{:02x} claims {} bytes but only {} are available",
                id,
                len,
                self.buf.len() - start
            )));
        }
        Ok((id, end))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub command: u8,
    pub status: u8,
    pub description: String,
}

impl StatusResponse {
    pub fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let (command, end) = reader.read_command_header()?;
        let status = reader.read_u8()?;
        let description = reader.read_string()?;
        reader.skip_to(end)?;
        Ok(Self {
            command,
            status,
            description,
        })
    }

    /// 確認回應對應到送出的指令且狀態為 OK
    pub fn check(&self, expected: u8) -> Result<()> {
        if self.command != expected {
            return Err(TrafficError::protocol(format!(
                "status for command 0x{:02x} while waiting for 0x{:02x} ({})",
                self.command,
                expected,
                command_name(expected)
            )));
        }
        match self.status {
            RTYPE_OK => Ok(()),
            RTYPE_NOTIMPLEMENTED => Err(TrafficError::CommandFailed {
                command: self.command,
                description: format!("not implemented: {}", self.description),
            }),
            _ => Err(TrafficError::CommandFailed {
                command: self.command,
                description: self.description.clone(),
            }),
        }
    }
}

/// 解析查詢指令的回應內容（狀態之後的那一段）
pub fn read_variable_response(
    reader: &mut Reader<'_>,
    domain: u8,
    variable: u8,
    object_id: &str,
) -> Result<TraciValue> {
    let (id, end) = reader.read_command_header()?;
    let expected = domain.wrapping_add(RESPONSE_OFFSET);
    if id != expected {
        return Err(TrafficError::protocol(format!(
            "expected response 0x{:02x}, got 0x{:02x}",
            expected, id
        )));
    }
    let var = reader.read_u8()?;
    let obj = reader.read_string()?;
    if var != variable || obj != object_id {
        return Err(TrafficError::protocol(format!(
            "response for variable 0x{:02x} of '{}', expected 0x{:02x} of '{}'",
            var, obj, variable, object_id
        )));
    }
    let value = reader.read_typed()?;
    reader.skip_to(end)?;
    Ok(value)
}

/// 第一個 logic 即目前使用的程式
pub fn parse_ryg_definition(value: TraciValue) -> Result<TlsProgram> {
    let logics = value.into_compound()?;
    let first = logics
        .into_iter()
        .next()
        .ok_or_else(|| TrafficError::protocol("traffic light has no program logic"))?;

    let mut fields = first.into_compound()?.into_iter();
    let mut next_field = |name: &str| {
        fields
            .next()
            .ok_or_else(|| TrafficError::protocol(format!("logic is missing {}", name)))
    };
    let program_id = next_field("programID")?.into_string()?;
    let _logic_type = next_field("type")?.as_i32()?;
    let current_phase = next_field("currentPhaseIndex")?.as_count()? as usize;
    let phases = next_field("phases")?
        .into_compound()?
        .into_iter()
        .map(parse_phase)
        .collect::<Result<Vec<_>>>()?;

    Ok(TlsProgram {
        program_id,
        current_phase,
        phases,
    })
}

fn parse_phase(value: TraciValue) -> Result<PhaseDef> {
    let items = value.into_compound()?;
    if items.len() < 4 {
        return Err(TrafficError::protocol(format!(
            "phase definition has {} fields, expected at least 4",
            items.len()
        )));
    }
    let mut items = items.into_iter();
    let mut next = || items.next().ok_or_else(|| TrafficError::protocol("truncated phase"));
    let duration = next()?.as_f64()?;
    let state = next()?.into_string()?;
    let min_duration = next()?.as_f64()?;
    let max_duration = next()?.as_f64()?;
    let _next_phases = items.next();
    let name = match items.next() {
        Some(v) => v.into_string()?,
        None => String::new(),
    };
    Ok(PhaseDef {
        duration,
        state,
        min_duration,
        max_duration,
        name,
    })
}
