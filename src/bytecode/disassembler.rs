//! Human-readable dumps of compiled blocks, for the REPL `.dis` command
//! and debugging.

use super::block::CodeRef;
use super::opcode as op;

fn op_name(opcode: u32) -> &'static str {
    match opcode {
        op::START => "START",
        op::OFFSET => "OFFSET",
        op::ENTER => "ENTER",
        op::ENTER_RESULT => "ENTER_RESULT",
        op::EXIT => "EXIT",
        op::NULL => "NULL",
        op::TRUE => "TRUE",
        op::FALSE => "FALSE",
        op::VAL => "VAL",
        op::VALI => "VALI",
        op::MACRO => "MACRO",
        op::POP => "POP",
        op::DUP => "DUP",
        op::NOT => "NOT",
        op::FORCE => "FORCE",
        op::RESULT => "RESULT",
        op::RESULT_ARG => "RESULT_ARG",
        op::JUMP => "JUMP",
        op::JUMP_TRUE => "JUMP_TRUE",
        op::JUMP_FALSE => "JUMP_FALSE",
        op::JUMP_RESULT_TRUE => "JUMP_RESULT_TRUE",
        op::JUMP_RESULT_FALSE => "JUMP_RESULT_FALSE",
        op::BREAK => "BREAK",
        op::BLOCK => "BLOCK",
        op::EMPTY => "EMPTY",
        op::COMPILE => "COMPILE",
        op::COND => "COND",
        op::IDENT => "IDENT",
        op::IDENT_U => "IDENT_U",
        op::IDENT_ARG => "IDENT_ARG",
        op::LOOKUP => "LOOKUP",
        op::LOOKUP_U => "LOOKUP_U",
        op::LOOKUP_ARG => "LOOKUP_ARG",
        op::SVAR => "SVAR",
        op::SVAR1 => "SVAR1",
        op::IVAR => "IVAR",
        op::IVAR1 => "IVAR1",
        op::IVAR2 => "IVAR2",
        op::IVAR3 => "IVAR3",
        op::FVAR => "FVAR",
        op::FVAR1 => "FVAR1",
        op::PRINT => "PRINT",
        op::COM => "COM",
        op::COM_V => "COM_V",
        op::COM_C => "COM_C",
        op::CALL => "CALL",
        op::CALL_U => "CALL_U",
        op::CALL_ARG => "CALL_ARG",
        op::CONC => "CONC",
        op::CONC_W => "CONC_W",
        op::CONC_M => "CONC_M",
        op::ALIAS => "ALIAS",
        op::ALIAS_U => "ALIAS_U",
        op::ALIAS_ARG => "ALIAS_ARG",
        op::LOCAL => "LOCAL",
        op::DO => "DO",
        op::DO_ARGS => "DO_ARGS",
        _ => "??",
    }
}

fn ret_name(ret: u32) -> &'static str {
    match ret {
        op::RET_INT => "|INT",
        op::RET_FLOAT => "|FLOAT",
        op::RET_STR => "|STR",
        _ => "",
    }
}

/// Render every instruction of the block owning `code`.
pub fn disassemble(code: &CodeRef) -> String {
    let words = &code.block.code;
    let mut out = String::new();
    let mut ip = 0;
    while ip < words.len() {
        let word = words[ip];
        let opcode = op::op(word);
        out.push_str(&format!(
            "{:4}  {}{}",
            ip,
            op_name(opcode),
            ret_name(op::ret(word))
        ));
        ip += 1;
        match opcode {
            op::MACRO => {
                let len = op::imm(word) as usize;
                out.push_str(&format!(" {:?}", op::read_inline_str(words, ip, len)));
                ip += op::inline_words(len);
            }
            op::VAL => match op::ret(word) {
                op::RET_STR => {
                    let len = op::imm(word) as usize;
                    out.push_str(&format!(" {:?}", op::read_inline_str(words, ip, len)));
                    ip += op::inline_words(len);
                }
                op::RET_INT => {
                    out.push_str(&format!(" {}", words[ip] as i32));
                    ip += 1;
                }
                op::RET_FLOAT => {
                    out.push_str(&format!(" {}", f32::from_bits(words[ip])));
                    ip += 1;
                }
                _ => {}
            },
            op::VALI => match op::ret(word) {
                op::RET_STR => out.push_str(&format!(" {:?}", op::unpack_chars(word))),
                _ => out.push_str(&format!(" {}", op::imm_signed(word))),
            },
            op::CALL | op::CALL_ARG | op::COM_V | op::COM_C => {
                out.push_str(&format!(
                    " ident={} args={}",
                    op::call_ident(word),
                    op::call_args(word)
                ));
            }
            _ => {
                let imm = op::imm(word);
                if imm != 0 {
                    out.push_str(&format!(" {}", imm));
                }
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode as op;

    #[test]
    fn dumps_every_word() {
        let mut code = vec![op::START, op::VALI | op::RET_INT | (7 << 8)];
        op::push_inline_str(&mut code, op::VAL | op::RET_STR, b"hello world");
        code.push(op::EXIT);
        let text = disassemble(&CodeRef::main(code));
        assert!(text.contains("VALI|INT 7"));
        assert!(text.contains("\"hello world\""));
        assert!(text.trim_end().ends_with("EXIT"));
    }
}
